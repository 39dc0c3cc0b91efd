use std::collections::HashMap;
use std::sync::Arc;

use tasklane_core::Params;

use crate::job::Job;

/// Rebuilds runnable jobs from persisted records by type name.
pub trait JobFactory: Send + Sync {
    /// `None` means the type is unknown and the record will be dropped.
    fn create(&self, job_type: &str, params: &Params) -> Option<Arc<dyn Job>>;
}

type Constructor = Box<dyn Fn(&Params) -> Arc<dyn Job> + Send + Sync>;

/// Map-backed [`JobFactory`].
#[derive(Default)]
pub struct JobRegistry {
    constructors: HashMap<String, Constructor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `job_type`, replacing any previous one.
    pub fn register<F, J>(&mut self, job_type: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&Params) -> J + Send + Sync + 'static,
        J: Job,
    {
        self.constructors.insert(
            job_type.into(),
            Box::new(move |params| Arc::new(constructor(params)) as Arc<dyn Job>),
        );
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.constructors.contains_key(job_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl JobFactory for JobRegistry {
    fn create(&self, job_type: &str, params: &Params) -> Option<Arc<dyn Job>> {
        self.constructors.get(job_type).map(|build| build(params))
    }
}
