use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{CommandHandler, DropHandler, HandlerContext, MessageHandler, SenMlHandler};

/// Every handler variant the bridge ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerKind {
    Drop,
    Command,
    SenMl,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 3] = [Self::Drop, Self::Command, Self::SenMl];

    /// Name used in queue configuration.
    pub fn name(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Command => "command",
            Self::SenMl => "senml",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Factory = fn(HandlerContext) -> Arc<dyn MessageHandler>;

fn build_drop(context: HandlerContext) -> Arc<dyn MessageHandler> {
    Arc::new(DropHandler::new(context.queue_id))
}

fn build_command(context: HandlerContext) -> Arc<dyn MessageHandler> {
    Arc::new(CommandHandler::new(context))
}

fn build_senml(context: HandlerContext) -> Arc<dyn MessageHandler> {
    Arc::new(SenMlHandler::new(context))
}

/// Maps configured handler names to constructors.
pub struct HandlerRegistry {
    factories: BTreeMap<&'static str, (HandlerKind, Factory)>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl HandlerRegistry {
    pub fn builtin() -> Self {
        let mut factories: BTreeMap<&'static str, (HandlerKind, Factory)> = BTreeMap::new();
        for kind in HandlerKind::ALL {
            let factory: Factory = match kind {
                HandlerKind::Drop => build_drop,
                HandlerKind::Command => build_command,
                HandlerKind::SenMl => build_senml,
            };
            factories.insert(kind.name(), (kind, factory));
        }
        Self { factories }
    }

    /// Look a configured name up, ignoring case and surrounding whitespace.
    pub fn lookup(&self, name: &str) -> Option<HandlerKind> {
        self.factories
            .get(name.trim().to_ascii_lowercase().as_str())
            .map(|(kind, _)| *kind)
    }

    pub fn instantiate(
        &self,
        kind: HandlerKind,
        context: HandlerContext,
    ) -> Arc<dyn MessageHandler> {
        match self.factories.get(kind.name()) {
            Some((_, factory)) => factory(context),
            None => build_drop(context),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}
