use crate::cache::Cache;
use crate::client::CiApi;
use crate::config::GatherOptions;

/// Entry point for gathering. Every gather goes through the local cache
/// before touching the API.
///
/// The gather methods live next to the records they produce:
/// [`Gatherer::workflow_run`], [`Gatherer::commit`] and
/// [`Gatherer::pull_request`].
pub struct Gatherer<A> {
    pub(crate) api: A,
    pub(crate) cache: Cache,
    pub(crate) options: GatherOptions,
}

impl<A: CiApi> Gatherer<A> {
    pub fn new(api: A, options: GatherOptions) -> Self {
        Self {
            api,
            cache: Cache::new(options.data_dir.clone()),
            options,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn options(&self) -> &GatherOptions {
        &self.options
    }
}
