use crate::enums::{OpCode, Rcode};
use crate::error::HandlerError;
use crate::models::{Query, Response, RuleResult};
use crate::reply::Reply;
use crate::rules::Rule;
use crate::Message;

use log::debug;
use std::any::TypeId;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex};

/// Convert a [RuleResult] to a [Response].
pub fn coerce_to_response(result: RuleResult) -> Response {
    match result {
        RuleResult::Response(response) => response,
        RuleResult::None => Response::new(),
        RuleResult::Record(record) => Response::from(record),
        RuleResult::Records(records) => Response::from(records),
    }
}

/// Handler invoked for an error that escaped the query middleware stack.
/// Must be robust - an error from one of these is only caught by the raw
/// exception layer above it.
pub type ExceptionHandler =
    Arc<dyn Fn(&Query, &(dyn StdError + 'static)) -> Result<Response, HandlerError> + Send + Sync>;

/// Handler invoked for an error that escaped the raw middleware stack.
pub type RawExceptionHandler =
    Arc<dyn Fn(&Message, &(dyn StdError + 'static)) -> Result<Reply, HandlerError> + Send + Sync>;

/// Runs at most once per server lifetime, before the first query.
pub type BeforeFirstQueryHook = Arc<dyn Fn() -> Result<(), HandlerError> + Send + Sync>;

/// Runs before each query; a non-`None` result short-circuits rule dispatch.
pub type BeforeQueryHook =
    Arc<dyn Fn(&Query) -> Result<RuleResult, HandlerError> + Send + Sync>;

/// Runs after each query, piping the response through.
pub type AfterQueryHook = Arc<dyn Fn(Response) -> Result<Response, HandlerError> + Send + Sync>;

/// An exception handler registered against a concrete error type.
///
/// Lookup walks the error's `source()` chain outermost-first and takes the
/// first registration whose type matches, so more specific wrapped errors
/// win over their causes.
pub(crate) struct HandlerRegistration<H> {
    pub(crate) type_id: TypeId,
    matches: Box<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>,
    handler: H,
}

pub(crate) fn registration_for<E, H>(handler: H) -> HandlerRegistration<H>
where
    E: StdError + 'static,
{
    HandlerRegistration {
        type_id: TypeId::of::<E>(),
        matches: Box::new(|error| error.downcast_ref::<E>().is_some()),
        handler,
    }
}

fn find_handler<'a, H>(
    registrations: &'a [HandlerRegistration<H>],
    error: &(dyn StdError + 'static),
) -> Option<&'a H> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        for registration in registrations {
            if (registration.matches)(err) {
                return Some(&registration.handler);
            }
        }
        current = err.source();
    }
    None
}

/// Middleware for interacting with [Query] objects.
///
/// `process_query` may call `call_next` zero or more times, transform the
/// result, swallow errors, or synthesize a response of its own.
pub trait QueryMiddleware: Send + Sync {
    fn process_query(
        &self,
        query: &Query,
        call_next: QueryNext<'_>,
    ) -> Result<Response, HandlerError>;
}

/// The rest of the query chain below the current middleware.
pub struct QueryNext<'a> {
    chain: &'a QueryChain,
    index: usize,
}

impl QueryNext<'_> {
    pub fn call(&self, query: &Query) -> Result<Response, HandlerError> {
        self.chain.call_at(self.index, query)
    }
}

/// A sealed stack of query middleware with the rule dispatcher at the
/// bottom. Built once when the server is readied; registration after that
/// point is impossible by construction.
pub struct QueryChain {
    stack: Vec<Box<dyn QueryMiddleware>>,
    terminal: RuleProcessor,
}

impl QueryChain {
    pub(crate) fn new(stack: Vec<Box<dyn QueryMiddleware>>, terminal: RuleProcessor) -> Self {
        QueryChain { stack, terminal }
    }

    pub fn process(&self, query: &Query) -> Result<Response, HandlerError> {
        self.call_at(0, query)
    }

    fn call_at(&self, index: usize, query: &Query) -> Result<Response, HandlerError> {
        match self.stack.get(index) {
            Some(middleware) => middleware.process_query(
                query,
                QueryNext {
                    chain: self,
                    index: index + 1,
                },
            ),
            None => self.terminal.process(query),
        }
    }
}

/// Middleware for handling errors originating from a query middleware stack.
///
/// Only one handler can exist for a given error type. If no registration
/// matches anywhere along the error's source chain, the default handler
/// answers SERVFAIL.
pub struct ExceptionHandlerMiddleware {
    handlers: Vec<HandlerRegistration<ExceptionHandler>>,
}

impl ExceptionHandlerMiddleware {
    pub(crate) fn new(handlers: Vec<HandlerRegistration<ExceptionHandler>>) -> Self {
        ExceptionHandlerMiddleware { handlers }
    }

    /// The default exception handler
    fn default_exception_handler(
        _query: &Query,
        error: &(dyn StdError + 'static),
    ) -> Response {
        debug!("returning SERVFAIL for unhandled error: {error}");
        Response::with_error_code(Rcode::ServFail)
    }
}

impl QueryMiddleware for ExceptionHandlerMiddleware {
    fn process_query(
        &self,
        query: &Query,
        call_next: QueryNext<'_>,
    ) -> Result<Response, HandlerError> {
        match call_next.call(query) {
            Ok(response) => Ok(response),
            Err(error) => {
                let error_ref: &(dyn StdError + 'static) = error.as_ref();
                match find_handler(&self.handlers, error_ref) {
                    Some(handler) => handler(query, error_ref),
                    None => Ok(Self::default_exception_handler(query, error_ref)),
                }
            }
        }
    }
}

#[derive(Default)]
struct FirstQueryState {
    run: bool,
    failed: bool,
}

/// Middleware for processing hook functions.
///
/// `before_first_query` hooks run at most once per server lifetime. If one
/// fails, the failure propagates to the exception handler and the remaining
/// `before_first_query` hooks never run - queries keep being processed
/// either way.
///
/// `before_query` hooks run in order before each query; the first non-`None`
/// result skips rule dispatch. `after_query` hooks pipe every response
/// through, short-circuited or not.
pub struct HookMiddleware {
    before_first_query: Vec<BeforeFirstQueryHook>,
    before_query: Vec<BeforeQueryHook>,
    after_query: Vec<AfterQueryHook>,
    // the only cross-query shared state in the whole stack
    first_query: Mutex<FirstQueryState>,
}

impl HookMiddleware {
    pub(crate) fn new(
        before_first_query: Vec<BeforeFirstQueryHook>,
        before_query: Vec<BeforeQueryHook>,
        after_query: Vec<AfterQueryHook>,
    ) -> Self {
        HookMiddleware {
            before_first_query,
            before_query,
            after_query,
            first_query: Mutex::new(FirstQueryState::default()),
        }
    }
}

impl QueryMiddleware for HookMiddleware {
    fn process_query(
        &self,
        query: &Query,
        call_next: QueryNext<'_>,
    ) -> Result<Response, HandlerError> {
        {
            let mut state = self
                .first_query
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !state.run {
                state.run = true;
                for hook in &self.before_first_query {
                    if let Err(error) = hook() {
                        state.failed = true;
                        return Err(error);
                    }
                }
            }
        }

        let mut result = RuleResult::None;
        let mut short_circuited = false;
        for hook in &self.before_query {
            let hook_result = hook(query)?;
            if !hook_result.is_none() {
                debug!("got result from before_query hook");
                result = hook_result;
                short_circuited = true;
                break;
            }
        }

        let mut response = match short_circuited {
            true => coerce_to_response(result),
            false => call_next.call(query)?,
        };

        for hook in &self.after_query {
            response = hook(response)?;
        }

        Ok(response)
    }
}

/// Find and run a matching rule function.
///
/// This is the bottom of the query middleware stack: first match in
/// registration order wins, and no match at all means NXDOMAIN.
pub struct RuleProcessor {
    rules: Vec<Rule>,
}

impl RuleProcessor {
    pub(crate) fn new(rules: Vec<Rule>) -> Self {
        RuleProcessor { rules }
    }

    pub fn process(&self, query: &Query) -> Result<Response, HandlerError> {
        for rule in &self.rules {
            if let Some(func) = rule.get_func(query) {
                debug!("matched rule: {rule}");
                return Ok(coerce_to_response(func(query)?));
            }
        }
        debug!("did not match any rule for {query}");
        Ok(Response::with_error_code(Rcode::NameError))
    }
}

/// Middleware run against raw DNS [Message]s, before anything is decoded
/// into the query model.
pub trait RawMiddleware: Send + Sync {
    fn process_message(
        &self,
        message: &Message,
        call_next: RawNext<'_>,
    ) -> Result<Reply, HandlerError>;
}

/// The rest of the raw chain below the current middleware.
pub struct RawNext<'a> {
    chain: &'a RawChain,
    index: usize,
}

impl RawNext<'_> {
    pub fn call(&self, message: &Message) -> Result<Reply, HandlerError> {
        self.chain.call_at(self.index, message)
    }
}

/// A sealed stack of raw middleware with the query-layer adaptor at the
/// bottom.
pub struct RawChain {
    stack: Vec<Box<dyn RawMiddleware>>,
    terminal: QueryProcessor,
}

impl RawChain {
    pub(crate) fn new(stack: Vec<Box<dyn RawMiddleware>>, terminal: QueryProcessor) -> Self {
        RawChain { stack, terminal }
    }

    pub fn process(&self, message: &Message) -> Result<Reply, HandlerError> {
        self.call_at(0, message)
    }

    fn call_at(&self, index: usize, message: &Message) -> Result<Reply, HandlerError> {
        match self.stack.get(index) {
            Some(middleware) => middleware.process_message(
                message,
                RawNext {
                    chain: self,
                    index: index + 1,
                },
            ),
            None => self.terminal.process(message),
        }
    }
}

/// Middleware for handling errors originating from a raw middleware stack.
///
/// Handlers here are expected to be robust - an error from one of these
/// escapes to the application loop and burns error budget.
pub struct RawExceptionHandlerMiddleware {
    handlers: Vec<HandlerRegistration<RawExceptionHandler>>,
}

impl RawExceptionHandlerMiddleware {
    pub(crate) fn new(handlers: Vec<HandlerRegistration<RawExceptionHandler>>) -> Self {
        RawExceptionHandlerMiddleware { handlers }
    }

    /// Default exception handler: an empty SERVFAIL reply.
    fn default_exception_handler(message: &Message, error: &(dyn StdError + 'static)) -> Reply {
        debug!("returning SERVFAIL reply for unhandled error: {error}");
        let mut reply = message.reply();
        reply.header.set_rcode(Rcode::ServFail);
        reply
    }
}

impl RawMiddleware for RawExceptionHandlerMiddleware {
    fn process_message(
        &self,
        message: &Message,
        call_next: RawNext<'_>,
    ) -> Result<Reply, HandlerError> {
        match call_next.call(message) {
            Ok(reply) => Ok(reply),
            Err(error) => {
                let error_ref: &(dyn StdError + 'static) = error.as_ref();
                match find_handler(&self.handlers, error_ref) {
                    Some(handler) => handler(message, error_ref),
                    None => Ok(Self::default_exception_handler(message, error_ref)),
                }
            }
        }
    }
}

/// Decode an incoming message and pass it to a query middleware stack.
///
/// This is the bottom of the raw middleware stack. Anything that is not a
/// single-question QUERY gets turned away here: non-QUERY opcodes answer
/// NOTIMP, requests with a question count other than one answer REFUSED,
/// and unrecognised question types answer FORMERR.
pub struct QueryProcessor {
    query_chain: QueryChain,
}

impl QueryProcessor {
    pub(crate) fn new(query_chain: QueryChain) -> Self {
        QueryProcessor { query_chain }
    }

    pub fn process(&self, message: &Message) -> Result<Reply, HandlerError> {
        let mut reply = message.reply();

        if message.header.opcode() != OpCode::Query {
            debug!("received non-query opcode: {:?}", message.header.opcode());
            reply.header.set_rcode(Rcode::NotImplemented);
            return Ok(reply);
        }

        // To simplify things we only respond if there is exactly one
        // question. This is apparently common amongst DNS server
        // implementations, see https://stackoverflow.com/q/4082081
        if message.header.qdcount != 1 {
            debug!("received question count != 1 ({})", message.header.qdcount);
            reply.header.set_rcode(Rcode::Refused);
            return Ok(reply);
        }

        let question = match &message.question {
            Some(question) => question,
            None => {
                reply.header.set_rcode(Rcode::Refused);
                return Ok(reply);
            }
        };

        let query = match Query::try_from(question) {
            Ok(query) => query,
            Err(error) => {
                debug!("failed to decode question {question}: {error}");
                reply.header.set_rcode(Rcode::FormatError);
                return Ok(reply);
            }
        };

        let response = self.query_chain.process(&query)?;

        // Filled in one section at a time, but an error above means the
        // whole reply is discarded for a fresh SERVFAIL one - clients never
        // see a half-built response.
        reply.answers = response.answer_records();
        reply.additional = response.additional_records();
        reply.authorities = response.authority_records();
        reply.header.set_rcode(response.error_code);
        Ok(reply)
    }
}
