// -----------------------------------------------------------------------------
// ----- ServiceConfig ---------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    /// Enforce thread affinity for this service's sessions.
    pub aligned: bool,
    /// Sessions of this service are management sessions.
    pub management: bool,
    /// Size of the internally created pool; zero means one per core. Ignored
    /// when the service is given a shared pool.
    pub workers: usize,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aligned: true,
            management: false,
            workers: 0,
        }
    }

    pub fn aligned(mut self, aligned: bool) -> Self {
        self.aligned = aligned;
        self
    }

    pub fn management(mut self, management: bool) -> Self {
        self.management = management;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}
