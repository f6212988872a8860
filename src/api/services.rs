// src/api/services.rs

//! User-defined service descriptors and call dispatch.
//!
//! A service is declared once at startup (name, typed argument list,
//! handler) and invoked by clients through `ExecuteServiceRequest`. Argument
//! validation failures are reported back to the caller as a typed failure
//! response by the connection layer; they are never a connection-level fault.

use crate::api::message::{ServiceArgType, ServiceArgValue};
use crate::core::EmberlinkError;
use tracing::debug;

/// Declared argument of a service: a name for diagnostics plus its type.
#[derive(Debug, Clone)]
pub struct ServiceArg {
    pub name: String,
    pub arg_type: ServiceArgType,
}

/// Static declaration of a callable service. Not mutated at runtime.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub key: u32,
    pub name: String,
    pub args: Vec<ServiceArg>,
}

/// Handler invoked with validated, correctly-typed arguments.
pub type ServiceHandler = Box<dyn FnMut(&[ServiceArgValue]) + Send>;

/// The set of registered services, consumed read-only by dispatch.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<(ServiceDescriptor, ServiceHandler)>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.iter().map(|(d, _)| d).collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ServiceDescriptor, handler: ServiceHandler) {
        self.services.push((descriptor, handler));
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter().map(|(d, _)| d)
    }

    /// Validates a call against the descriptor and invokes the handler.
    pub fn execute(&mut self, key: u32, args: &[ServiceArgValue]) -> Result<(), EmberlinkError> {
        let (descriptor, handler) = self
            .services
            .iter_mut()
            .find(|(d, _)| d.key == key)
            .ok_or(EmberlinkError::UnknownService(key))?;

        if args.len() != descriptor.args.len() {
            return Err(EmberlinkError::WrongArgumentCount(descriptor.name.clone()));
        }
        for (value, declared) in args.iter().zip(descriptor.args.iter()) {
            if value.arg_type() != declared.arg_type {
                return Err(EmberlinkError::WrongArgumentType(format!(
                    "{}.{}",
                    descriptor.name, declared.name
                )));
            }
        }

        debug!("Executing service '{}'", descriptor.name);
        handler(args);
        Ok(())
    }
}
