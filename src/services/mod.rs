pub mod locator;
pub mod query;
pub mod registry;

pub(crate) use locator::ExecutableLocator;
#[cfg(test)]
pub(crate) use locator::Strategy;
pub(crate) use query::{QueryRequest, QueryResult, QueryService};
pub(crate) use registry::ProcessRegistry;
