use std::{fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{
    event::SessionEvent,
    session::{Session, SessionId},
    stage::{Stage, StageContext},
};
use crate::worker::WorkerHandle;

// -----------------------------------------------------------------------------
// ----- Types -----------------------------------------------------------------

pub type StageFactory = Arc<dyn Fn(SessionId) -> Box<dyn Stage> + Send + Sync>;

type Stages = SmallVec<[Box<dyn Stage>; 4]>;

// -----------------------------------------------------------------------------
// ----- PipelineBuilder -------------------------------------------------------

/// Recipe for a session's pipeline. Every affinity change builds a fresh
/// pipeline from it; pipelines are never edited in place.
#[derive(Clone, Default)]
pub struct PipelineBuilder {
    factories: Vec<StageFactory>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage<F>(mut self, factory: F) -> Self
    where
        F: Fn(SessionId) -> Box<dyn Stage> + Send + Sync + 'static,
    {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn push(&mut self, factory: StageFactory) {
        self.factories.push(factory);
    }

    /// Prepend, so the stage sees inbound events before the others.
    pub fn push_front(&mut self, factory: StageFactory) {
        self.factories.insert(0, factory);
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub(crate) fn build(
        &self,
        session: SessionId,
        owner: WorkerHandle,
        generation: u64,
    ) -> Pipeline {
        let stages = self.factories.iter().map(|f| f(session)).collect();
        Pipeline {
            owner: Some(owner),
            generation,
            stages: Mutex::new(stages),
        }
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("stages", &self.factories.len())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ----- Pipeline --------------------------------------------------------------

/// Stage chain bound to one owner worker. The stage lock is only ever taken
/// by the owning thread, so it is uncontended for aligned sessions.
pub struct Pipeline {
    owner: Option<WorkerHandle>,
    generation: u64,
    stages: Mutex<Stages>,
}

// -----------------------------------------------------------------------------
// ----- Pipeline: Static ------------------------------------------------------

impl Pipeline {
    /// Placeholder held by a session before its first affinity is set.
    pub(crate) fn unbound() -> Self {
        Self {
            owner: None,
            generation: 0,
            stages: Mutex::new(SmallVec::new()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Pipeline: Public ------------------------------------------------------

impl Pipeline {
    pub fn owner(&self) -> Option<&WorkerHandle> {
        self.owner.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.lock().iter().map(|s| s.name()).collect()
    }
}

// -----------------------------------------------------------------------------
// ----- Pipeline: Crate -------------------------------------------------------

impl Pipeline {
    /// Run `event` through every stage. Returns what the stages emitted.
    pub(crate) fn fire_inbound(&self, session: &Session, event: &SessionEvent) -> Vec<Bytes> {
        let mut ctx = StageContext::new(session);
        let mut stages = self.stages.lock();
        for stage in stages.iter_mut() {
            stage.on_event(&mut ctx, event);
        }
        drop(stages);
        ctx.into_emitted()
    }

    /// Run `message` back-to-front. Returns the message if no stage
    /// swallowed it, plus anything emitted on the way.
    pub(crate) fn fire_outbound(
        &self,
        session: &Session,
        message: Bytes,
    ) -> (Option<Bytes>, Vec<Bytes>) {
        let mut ctx = StageContext::new(session);
        let mut stages = self.stages.lock();

        let mut current = Some(message);
        for stage in stages.iter_mut().rev() {
            let Some(message) = current.take() else {
                break;
            };
            current = stage.on_write(&mut ctx, message);
        }
        drop(stages);

        (current, ctx.into_emitted())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("owner", &self.owner.as_ref().map(|o| o.id()))
            .field("generation", &self.generation)
            .finish()
    }
}
