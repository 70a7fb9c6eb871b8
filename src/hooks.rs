use crate::model::RequestContext;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle points of the surrounding request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Before the transformation chain runs. `Stop` means the response is
    /// complete and every remaining transformation and render step is skipped.
    ImageGet,
    /// Loading the source pixels. `Stop` means the source is already in the
    /// response model and the primary store must not be read.
    ImageLoad,
    /// After a successful render, just before the response goes out.
    ResponseSend,
    /// After a new image has been accepted into the primary store.
    ImageStored,
    /// The image was deleted, or its pixel content replaced.
    ImageDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[async_trait::async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stages this hook is registered for, in the order it declares them.
    fn stages(&self) -> &'static [Stage];

    async fn handle(&self, stage: Stage, ctx: &mut RequestContext) -> Flow;
}

/// Statically ordered hook lists per stage, fixed at startup.
#[derive(Default, Clone)]
pub struct HookChain {
    stages: BTreeMap<Stage, Vec<Arc<dyn Hook>>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hook` to every stage it declares. Hooks run in registration order.
    pub fn register(mut self, hook: Arc<dyn Hook>) -> Self {
        for stage in hook.stages() {
            self.stages.entry(*stage).or_default().push(hook.clone());
        }
        self
    }

    pub fn hooks(&self, stage: Stage) -> impl Iterator<Item = &'static str> + '_ {
        self.stages.get(&stage).into_iter().flatten().map(|h| h.name())
    }

    pub async fn dispatch(&self, stage: Stage, ctx: &mut RequestContext) -> Flow {
        let Some(hooks) = self.stages.get(&stage) else {
            return Flow::Continue;
        };
        for hook in hooks {
            if hook.handle(stage, ctx).await == Flow::Stop {
                tracing::debug!("{} stopped {:?} for {}/{}", hook.name(), stage, ctx.owner(), ctx.image_id());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}
