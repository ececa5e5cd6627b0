use crate::error::{HandlerError, YakNsError};
use crate::middleware::{
    registration_for, AfterQueryHook, BeforeFirstQueryHook, BeforeQueryHook, ExceptionHandler,
    ExceptionHandlerMiddleware, HandlerRegistration, HookMiddleware, QueryChain, QueryMiddleware,
    QueryProcessor, RawChain, RawExceptionHandler, RawExceptionHandlerMiddleware, RawMiddleware,
    RuleProcessor,
};
use crate::models::{Query, Response, RuleResult};
use crate::reply::Reply;
use crate::rules::{smart_make_rule, QtypeFilter, ResponseFunction, Rule, RuleAction, RuleMatcher, RuleSpec};
use crate::Message;

use log::{debug, warn};
use std::error::Error as StdError;
use std::sync::Arc;

/// A pure rule container.
///
/// Registering a blueprint as a rule on a server (or another blueprint)
/// makes its rules get consulted whenever the outer rule matches, while the
/// enclosing server's middleware, hooks and exception handlers keep doing
/// the work. Compare [NameServer::register_subserver], which scopes a whole
/// new middleware stack to the subtree.
pub struct Blueprint {
    name: String,
    rules: Vec<Rule>,
}

impl Blueprint {
    pub fn new(name: &str) -> Self {
        Blueprint {
            name: name.to_string(),
            rules: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Register a handler under a shorthand rule, see
    /// [smart_make_rule](crate::rules::smart_make_rule).
    pub fn rule<F>(
        &mut self,
        spec: impl Into<RuleSpec>,
        allowed_qtypes: impl Into<QtypeFilter>,
        func: F,
    ) -> Result<(), YakNsError>
    where
        F: Fn(&Query) -> Result<RuleResult, HandlerError> + Send + Sync + 'static,
    {
        let rule = smart_make_rule(spec, allowed_qtypes, Arc::new(func), false)?;
        self.register_rule(rule);
        Ok(())
    }

    /// Register the given rule.
    pub fn register_rule(&mut self, rule: Rule) {
        debug!("registering rule on blueprint {}: {rule}", self.name);
        self.rules.push(rule);
    }

    /// Register a nested blueprint behind the given matcher. Dispatch
    /// recurses through nested containers in first-match order.
    pub fn register_blueprint(
        &mut self,
        blueprint: Blueprint,
        matcher: RuleMatcher,
        allowed_qtypes: impl Into<QtypeFilter>,
    ) -> Result<(), YakNsError> {
        let rule = Rule::with_action(
            matcher,
            allowed_qtypes.into(),
            false,
            RuleAction::Blueprint(Arc::new(blueprint)),
        )?;
        self.register_rule(rule);
        Ok(())
    }

    /// First-match lookup across this container, recursing into nested
    /// blueprints. A matching outer rule with no matching inner rule yields
    /// `None` so that dispatch continues past it.
    pub(crate) fn lookup(&self, query: &Query) -> Option<ResponseFunction> {
        for rule in &self.rules {
            if let Some(func) = rule.get_func(query) {
                return Some(func);
            }
        }
        None
    }
}

/// A programmable name server: a rule container plus the middleware, hook
/// and exception-handler registrations that will wrap those rules.
///
/// All registration happens on `&mut self`. Converting into a
/// [RawNameServer] (or registering as a sub-server) builds the middleware
/// chains and freezes the lot - there is no way to register anything
/// afterwards.
pub struct NameServer {
    name: String,
    rules: Vec<Rule>,
    query_middleware: Vec<Box<dyn QueryMiddleware>>,
    raw_middleware: Vec<Box<dyn RawMiddleware>>,
    exception_handlers: Vec<HandlerRegistration<ExceptionHandler>>,
    raw_exception_handlers: Vec<HandlerRegistration<RawExceptionHandler>>,
    before_first_query: Vec<BeforeFirstQueryHook>,
    before_query: Vec<BeforeQueryHook>,
    after_query: Vec<AfterQueryHook>,
}

impl NameServer {
    /// `name` is only used for logging.
    pub fn new(name: &str) -> Self {
        NameServer {
            name: name.to_string(),
            rules: vec![],
            query_middleware: vec![],
            raw_middleware: vec![],
            exception_handlers: vec![],
            raw_exception_handlers: vec![],
            before_first_query: vec![],
            before_query: vec![],
            after_query: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Register a handler under a shorthand rule, see
    /// [smart_make_rule](crate::rules::smart_make_rule).
    pub fn rule<F>(
        &mut self,
        spec: impl Into<RuleSpec>,
        allowed_qtypes: impl Into<QtypeFilter>,
        func: F,
    ) -> Result<(), YakNsError>
    where
        F: Fn(&Query) -> Result<RuleResult, HandlerError> + Send + Sync + 'static,
    {
        let rule = smart_make_rule(spec, allowed_qtypes, Arc::new(func), false)?;
        self.register_rule(rule);
        Ok(())
    }

    /// Register the given rule. Rules dispatch first-match in registration
    /// order.
    pub fn register_rule(&mut self, rule: Rule) {
        debug!("registering rule on {}: {rule}", self.name);
        self.rules.push(rule);
    }

    /// Register a blueprint behind the given matcher.
    ///
    /// If the matcher triggers, the query is passed to the blueprint's own
    /// rules. The outer rule matching does not mean any rule in the
    /// blueprint will match.
    pub fn register_blueprint(
        &mut self,
        blueprint: Blueprint,
        matcher: RuleMatcher,
        allowed_qtypes: impl Into<QtypeFilter>,
    ) -> Result<(), YakNsError> {
        debug!(
            "registering blueprint {} on {}",
            blueprint.name, self.name
        );
        let rule = Rule::with_action(
            matcher,
            allowed_qtypes.into(),
            false,
            RuleAction::Blueprint(Arc::new(blueprint)),
        )?;
        self.register_rule(rule);
        Ok(())
    }

    /// Register another server behind the given matcher.
    ///
    /// The sub-server keeps its own exception handlers, middleware and
    /// hooks, scoped to the subtree; its chain is built here, so register
    /// nested sub-servers inside-out.
    pub fn register_subserver(
        &mut self,
        subserver: NameServer,
        matcher: RuleMatcher,
        allowed_qtypes: impl Into<QtypeFilter>,
    ) -> Result<(), YakNsError> {
        debug!(
            "registering subserver {} on {}",
            subserver.name, self.name
        );
        if !subserver.raw_middleware.is_empty() || !subserver.raw_exception_handlers.is_empty() {
            warn!(
                "sub-server {} has raw-layer registrations, those only run on a top-level server",
                subserver.name
            );
        }
        let chain = Arc::new(subserver.into_query_chain());
        let func: ResponseFunction =
            Arc::new(move |query: &Query| chain.process(query).map(RuleResult::Response));
        let rule = Rule::with_action(
            matcher,
            allowed_qtypes.into(),
            false,
            RuleAction::Function(func),
        )?;
        self.register_rule(rule);
        Ok(())
    }

    /// Add user middleware to the query layer. Middleware runs in
    /// registration order, between the exception handler and the hooks.
    pub fn register_middleware(&mut self, middleware: Box<dyn QueryMiddleware>) {
        self.query_middleware.push(middleware);
    }

    /// Add user middleware to the raw message layer.
    pub fn register_raw_middleware(&mut self, middleware: Box<dyn RawMiddleware>) {
        self.raw_middleware.push(middleware);
    }

    /// Register an exception handler for the concrete error type `E` at the
    /// query layer. Registering the same type again replaces the previous
    /// handler.
    pub fn register_exception_handler<E, F>(&mut self, handler: F)
    where
        E: StdError + 'static,
        F: Fn(&Query, &(dyn StdError + 'static)) -> Result<Response, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let registration = registration_for::<E, ExceptionHandler>(Arc::new(handler));
        self.exception_handlers
            .retain(|existing| existing.type_id != registration.type_id);
        self.exception_handlers.push(registration);
    }

    /// Register an exception handler for the concrete error type `E` at the
    /// raw message layer.
    pub fn register_raw_exception_handler<E, F>(&mut self, handler: F)
    where
        E: StdError + 'static,
        F: Fn(&Message, &(dyn StdError + 'static)) -> Result<Reply, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let registration = registration_for::<E, RawExceptionHandler>(Arc::new(handler));
        self.raw_exception_handlers
            .retain(|existing| existing.type_id != registration.type_id);
        self.raw_exception_handlers.push(registration);
    }

    /// Register a hook to run once, before the first query this server
    /// processes.
    pub fn register_before_first_query<F>(&mut self, hook: F)
    where
        F: Fn() -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.before_first_query.push(Arc::new(hook));
    }

    /// Register a hook to run before every query. Returning a non-`None`
    /// result short-circuits rule dispatch.
    pub fn register_before_query<F>(&mut self, hook: F)
    where
        F: Fn(&Query) -> Result<RuleResult, HandlerError> + Send + Sync + 'static,
    {
        self.before_query.push(Arc::new(hook));
    }

    /// Register a hook to run on every response, short-circuited or not.
    pub fn register_after_query<F>(&mut self, hook: F)
    where
        F: Fn(Response) -> Result<Response, HandlerError> + Send + Sync + 'static,
    {
        self.after_query.push(Arc::new(hook));
    }

    /// Build this server's query chain:
    /// exception handler -> user middleware -> hooks -> rule dispatch.
    pub(crate) fn into_query_chain(self) -> QueryChain {
        let mut stack: Vec<Box<dyn QueryMiddleware>> = vec![Box::new(
            ExceptionHandlerMiddleware::new(self.exception_handlers),
        )];
        stack.extend(self.query_middleware);
        stack.push(Box::new(HookMiddleware::new(
            self.before_first_query,
            self.before_query,
            self.after_query,
        )));
        QueryChain::new(stack, RuleProcessor::new(self.rules))
    }
}

/// A [NameServer] with its middleware chains built and sealed, ready to
/// process wire-level messages. This is what transports and the application
/// loop talk to.
pub struct RawNameServer {
    name: String,
    raw_chain: RawChain,
}

impl RawNameServer {
    pub fn new(mut server: NameServer) -> Self {
        let name = server.name.clone();
        let raw_exception_handlers = std::mem::take(&mut server.raw_exception_handlers);
        let raw_middleware = std::mem::take(&mut server.raw_middleware);

        let mut stack: Vec<Box<dyn RawMiddleware>> = vec![Box::new(
            RawExceptionHandlerMiddleware::new(raw_exception_handlers),
        )];
        stack.extend(raw_middleware);

        let terminal = QueryProcessor::new(server.into_query_chain());
        RawNameServer {
            name,
            raw_chain: RawChain::new(stack, terminal),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one parsed message through the raw chain and hand back the reply.
    ///
    /// An error here means something escaped even the raw exception layer;
    /// the application loop counts those against its error budget.
    pub fn process_message(&self, message: &Message) -> Result<Reply, YakNsError> {
        self.raw_chain
            .process(message)
            .map_err(YakNsError::Handler)
    }
}

impl From<NameServer> for RawNameServer {
    fn from(server: NameServer) -> Self {
        RawNameServer::new(server)
    }
}
