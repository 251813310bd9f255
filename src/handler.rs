//! Handler dispatch: the seam between the serving core and the Flow
//! configuration engine.
//!
//! The Flow compiler/VM live outside this crate; the core only knows
//! (a) a compiled [`Program`] it can atomically swap, (b) a
//! [`HandlerFactory`] it consults once per request at header-end, and
//! (c) the typed native-callback registry the VM verifies against at
//! compile time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::channel::HttpChannel;
use crate::request::HttpRequestInfo;

/// A request handler: runs on the worker scheduler, mutates the
/// response through the channel, and eventually completes it.
pub type HttpHandler = Arc<dyn Fn(&mut HttpChannel) + Send + Sync>;

/// When the handler should run relative to body arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// Run at header-end; the body (if any) accumulates on the channel.
    Immediate,
    /// Run at message-end, once the full body has been consumed.
    Buffered,
}

/// Chooses a handler for each parsed request head.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, request: &HttpRequestInfo) -> (HttpHandler, BodyMode);
}

impl<F> HandlerFactory for F
where
    F: Fn(&HttpRequestInfo) -> (HttpHandler, BodyMode) + Send + Sync,
{
    fn create(&self, request: &HttpRequestInfo) -> (HttpHandler, BodyMode) {
        (self)(request)
    }
}

/// Value types crossing the Flow VM boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    Void,
    Boolean,
    Number,
    String,
    IPAddress,
    Cidr,
    RegExp,
    Handler,
    StringArray,
}

/// Declared shape of a native function exposed to Flow programs.
#[derive(Debug, Clone)]
pub struct NativeSignature {
    pub name: String,
    pub returns: FlowType,
    pub params: Vec<FlowType>,
}

impl NativeSignature {
    pub fn new(name: impl Into<String>, returns: FlowType, params: Vec<FlowType>) -> Self {
        NativeSignature {
            name: name.into(),
            returns,
            params,
        }
    }
}

impl fmt::Display for NativeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}", p)?;
        }
        write!(f, ") -> {:?}", self.returns)
    }
}

/// Compile-time check run against a call site's IR; returns a
/// diagnostic on mismatch.
pub type Verifier = Arc<dyn Fn(&NativeSignature) -> std::result::Result<(), String> + Send + Sync>;

/// A native function the VM may call back into.
pub struct NativeCallback {
    pub signature: NativeSignature,
    /// Returns true when the native handled the request (Flow `handler`
    /// semantics: execution stops).
    pub function: Arc<dyn Fn(&mut HttpChannel) -> bool + Send + Sync>,
    pub verifier: Option<Verifier>,
}

/// Registry of natives, filled once at startup before programs compile.
#[derive(Default)]
pub struct NativeRegistry {
    entries: HashMap<String, NativeCallback>,
}

impl NativeRegistry {
    pub fn new() -> NativeRegistry {
        NativeRegistry::default()
    }

    /// Registers a native; re-registering a name replaces the entry.
    pub fn register(&mut self, callback: NativeCallback) {
        self.entries
            .insert(callback.signature.name.clone(), callback);
    }

    pub fn get(&self, name: &str) -> Option<&NativeCallback> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Runs every registered verifier; the compiler calls this after
    /// lowering to IR.
    pub fn verify_all(&self) -> std::result::Result<(), String> {
        for callback in self.entries.values() {
            if let Some(ref verifier) = callback.verifier {
                verifier(&callback.signature)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A compiled Flow program with its entry handler factory.
pub struct Program {
    name: String,
    factory: Arc<dyn HandlerFactory>,
}

impl Program {
    pub fn new(name: impl Into<String>, factory: Arc<dyn HandlerFactory>) -> Program {
        Program {
            name: name.into(),
            factory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatches one request head to a handler.
    pub fn select(&self, request: &HttpRequestInfo) -> (HttpHandler, BodyMode) {
        self.factory.create(request)
    }
}

/// Holds the live program; configuration reload swaps it atomically
/// under the reload lock while in-flight requests keep their `Arc`.
pub struct ProgramHolder {
    current: Mutex<Arc<Program>>,
}

impl ProgramHolder {
    pub fn new(program: Arc<Program>) -> ProgramHolder {
        ProgramHolder {
            current: Mutex::new(program),
        }
    }

    pub fn load(&self) -> Arc<Program> {
        Arc::clone(&self.current.lock().expect("program lock"))
    }

    pub fn swap(&self, next: Arc<Program>) -> Arc<Program> {
        let mut current = self.current.lock().expect("program lock");
        std::mem::replace(&mut *current, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_verifies_signatures() {
        let mut registry = NativeRegistry::new();
        registry.register(NativeCallback {
            signature: NativeSignature::new("docroot", FlowType::Void, vec![FlowType::String]),
            function: Arc::new(|_| false),
            verifier: Some(Arc::new(|sig| {
                if sig.params.len() == 1 {
                    Ok(())
                } else {
                    Err(format!("{}: wrong arity", sig.name))
                }
            })),
        });
        assert!(registry.verify_all().is_ok());
        registry.register(NativeCallback {
            signature: NativeSignature::new("broken", FlowType::Void, vec![]),
            function: Arc::new(|_| false),
            verifier: Some(Arc::new(|sig| Err(format!("{}: no good", sig.name)))),
        });
        assert!(registry.verify_all().is_err());
    }

    #[test]
    fn program_swap_keeps_old_reference_alive() {
        let factory: Arc<dyn HandlerFactory> = Arc::new(
            |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (Arc::new(|_c: &mut HttpChannel| {}), BodyMode::Immediate)
            },
        );
        let old = Arc::new(Program::new("v1", Arc::clone(&factory)));
        let holder = ProgramHolder::new(Arc::clone(&old));
        let in_flight = holder.load();
        let replaced = holder.swap(Arc::new(Program::new("v2", factory)));
        assert_eq!(replaced.name(), "v1");
        assert_eq!(in_flight.name(), "v1");
        assert_eq!(holder.load().name(), "v2");
    }

    #[test]
    fn signature_displays_readably() {
        let sig = NativeSignature::new(
            "proxy.pass",
            FlowType::Boolean,
            vec![FlowType::String, FlowType::Number],
        );
        assert_eq!(format!("{}", sig), "proxy.pass(String, Number) -> Boolean");
    }
}
