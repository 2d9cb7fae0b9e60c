//! Attribute handler registry.
//!
//! # Responsibility
//! - Map attribute type names to handler factories.
//! - Build fresh handler instances per schema, wired to shared collaborators.
//!
//! # Invariants
//! - Handlers are stateful (preload caches); every `instantiate` call returns
//!   a new instance, so two schemas never share one.

use super::list::ResourceListHandler;
use super::parameters::{ParameterHandler, ParameterStore, SqliteParameterStore};
use super::range::DateRangeHandler;
use super::reference::{
    ClassResolver, IdentityDirectory, MemoryIdentityDirectory, PrincipalKind, PrincipalResolver,
    ReferenceHandler, ReferenceKind, ResourceResolver,
};
use super::scalar::{
    BooleanHandler, DateHandler, DecimalHandler, IntegerHandler, LongHandler, StringHandler,
    TextHandler,
};
use super::AttributeHandler;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collaborators handed to handler factories.
#[derive(Clone)]
pub struct HandlerContext {
    pub identity: Arc<dyn IdentityDirectory>,
    pub parameters: Arc<dyn ParameterStore>,
}

impl HandlerContext {
    pub fn new(identity: Arc<dyn IdentityDirectory>, parameters: Arc<dyn ParameterStore>) -> Self {
        Self {
            identity,
            parameters,
        }
    }
}

impl Default for HandlerContext {
    fn default() -> Self {
        Self::new(
            Arc::new(MemoryIdentityDirectory::new()),
            Arc::new(SqliteParameterStore::new()),
        )
    }
}

pub type HandlerFactory = Box<dyn Fn(&HandlerContext) -> Arc<dyn AttributeHandler> + Send + Sync>;

pub struct AttributeHandlerRegistry {
    context: HandlerContext,
    factories: BTreeMap<String, HandlerFactory>,
}

impl AttributeHandlerRegistry {
    /// Empty registry.
    pub fn new(context: HandlerContext) -> Self {
        Self {
            context,
            factories: BTreeMap::new(),
        }
    }

    /// Registry preloaded with every built-in attribute type.
    pub fn builtin(context: HandlerContext) -> Self {
        let mut registry = Self::new(context);
        registry.register("boolean", |_| Arc::new(BooleanHandler::new()));
        registry.register("integer", |_| Arc::new(IntegerHandler::new()));
        registry.register("long", |_| Arc::new(LongHandler::new()));
        registry.register("decimal", |_| Arc::new(DecimalHandler::new()));
        registry.register("date", |_| Arc::new(DateHandler::new()));
        registry.register("date_range", |_| Arc::new(DateRangeHandler::new()));
        registry.register("string", |_| Arc::new(StringHandler::new()));
        registry.register("text", |_| Arc::new(TextHandler::new()));
        registry.register("parameters", |ctx| {
            Arc::new(ParameterHandler::new(ctx.parameters.clone()))
        });
        registry.register("resource", |_| {
            Arc::new(ReferenceHandler::new(
                ReferenceKind::Resource,
                Arc::new(ResourceResolver),
            ))
        });
        registry.register("resource_class", |_| {
            Arc::new(ReferenceHandler::new(
                ReferenceKind::ResourceClass,
                Arc::new(ClassResolver),
            ))
        });
        for (name, reference, principal) in [
            ("role", ReferenceKind::Role, PrincipalKind::Role),
            ("subject", ReferenceKind::Subject, PrincipalKind::Subject),
            ("permission", ReferenceKind::Permission, PrincipalKind::Permission),
        ] {
            registry.register(name, move |ctx| {
                Arc::new(ReferenceHandler::new(
                    reference,
                    Arc::new(PrincipalResolver::new(principal, ctx.identity.clone())),
                ))
            });
        }
        registry.register("resource_list", |_| Arc::new(ResourceListHandler::strong()));
        registry.register("weak_resource_list", |_| Arc::new(ResourceListHandler::weak()));
        registry
    }

    /// Registers (or replaces) the factory for `type_name`.
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&HandlerContext) -> Arc<dyn AttributeHandler> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    /// New handler instance for `type_name`.
    pub fn instantiate(&self, type_name: &str) -> Option<Arc<dyn AttributeHandler>> {
        self.factories
            .get(type_name)
            .map(|factory| factory(&self.context))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn context(&self) -> &HandlerContext {
        &self.context
    }
}

impl Default for AttributeHandlerRegistry {
    fn default() -> Self {
        Self::builtin(HandlerContext::default())
    }
}
