//! Command registry — validated dispatch of wire commands to typed handlers.
//!
//! A registry is a frozen set of named definitions. Each definition pairs a
//! payload type (decoded with serde, then rule-checked) with an async
//! handler. `dispatch` is total: unknown names, invalid payloads, and
//! handler panics all come back as [`CommandResult::Failure`] values —
//! nothing escapes as a panic or an `Err`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;

use crate::error::RegistryError;
use crate::types::{CommandError, CommandResult, DomainCommand, WireCommand};

/// A typed command payload. Deserialization enforces shape; `check` reports
/// rule violations beyond that (formats, non-empty fields, ranges). An empty
/// vector means the payload is valid.
pub trait CommandPayload: DeserializeOwned + Send {
    fn check(&self) -> Vec<String> {
        Vec::new()
    }
}

type BoxedDispatch = Arc<dyn Fn(WireCommand) -> BoxFuture<'static, CommandResult> + Send + Sync>;

/// Immutable mapping `name → definition`. Construction enforces name
/// uniqueness; dispatch is `&self` and safe to share across tasks provided
/// the handlers are.
pub struct CommandRegistry {
    definitions: HashMap<String, BoxedDispatch>,
}

/// Collects definitions for [`CommandRegistry::build`](CommandRegistryBuilder::build).
#[derive(Default)]
pub struct CommandRegistryBuilder {
    definitions: Vec<(String, BoxedDispatch)>,
}

impl CommandRegistry {
    pub fn builder() -> CommandRegistryBuilder {
        CommandRegistryBuilder::default()
    }

    /// The registered command names, sorted.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Decode and run one wire command, reifying every failure mode into the
    /// result.
    pub async fn dispatch(&self, command: WireCommand) -> CommandResult {
        let Some(run) = self.definitions.get(&command.name) else {
            return CommandResult::failure(CommandError::HandlerNotFound {
                command_id: command.id,
                command_name: command.name,
                available_handlers: self.command_names(),
            });
        };
        run(command).await
    }
}

impl CommandRegistryBuilder {
    /// Register a definition: `name`, the payload type `P`, and a handler
    /// invoked with the validated [`DomainCommand`]. Handlers return their
    /// [`CommandResult`] directly; domain failures belong in the `Failure`
    /// variant, not in panics.
    pub fn define<P, H, Fut>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        P: CommandPayload + 'static,
        H: Fn(DomainCommand<P>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CommandResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let dispatch: BoxedDispatch = Arc::new(move |command: WireCommand| {
            run_command::<P, H, Fut>(Arc::clone(&handler), command).boxed()
        });
        self.definitions.push((name.into(), dispatch));
        self
    }

    /// Freeze the set. Duplicate names are a construction-time error.
    pub fn build(self) -> Result<CommandRegistry, RegistryError> {
        let mut definitions = HashMap::with_capacity(self.definitions.len());
        for (name, dispatch) in self.definitions {
            if definitions.insert(name.clone(), dispatch).is_some() {
                return Err(RegistryError::DuplicateCommand(name));
            }
        }
        Ok(CommandRegistry { definitions })
    }
}

async fn run_command<P, H, Fut>(handler: Arc<H>, command: WireCommand) -> CommandResult
where
    P: CommandPayload + 'static,
    H: Fn(DomainCommand<P>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = CommandResult> + Send + 'static,
{
    let payload: P = match serde_json::from_value(command.payload) {
        Ok(payload) => payload,
        Err(err) => {
            return CommandResult::failure(CommandError::Validation {
                command_id: command.id,
                command_name: command.name,
                errors: vec![err.to_string()],
            });
        }
    };

    let violations = payload.check();
    if !violations.is_empty() {
        return CommandResult::failure(CommandError::Validation {
            command_id: command.id,
            command_name: command.name,
            errors: violations,
        });
    }

    let command_id = command.id.clone();
    let domain = DomainCommand {
        id: command.id,
        target: command.target,
        name: command.name,
        payload,
    };

    // The handler contract is total over validated payloads: a panic while
    // constructing or polling the handler future becomes an UnknownError.
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(domain))) {
        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    match outcome {
        Ok(result) => result,
        Err(panic) => CommandResult::failure(CommandError::Unknown {
            command_id,
            message: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventStreamPosition;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct CreateUser {
        email: String,
        name: String,
    }

    impl CommandPayload for CreateUser {
        fn check(&self) -> Vec<String> {
            let mut errors = Vec::new();
            if !self.email.contains('@') {
                errors.push(format!("email is not an address: {}", self.email));
            }
            if self.name.is_empty() {
                errors.push("name must not be empty".into());
            }
            errors
        }
    }

    fn user_registry() -> CommandRegistry {
        CommandRegistry::builder()
            .define("CreateUser", |_cmd: DomainCommand<CreateUser>| async move {
                CommandResult::success(EventStreamPosition::new("user-123", 1))
            })
            .build()
            .unwrap()
    }

    fn create_user_command(payload: serde_json::Value) -> WireCommand {
        WireCommand {
            id: "cmd-123".into(),
            target: "user-456".into(),
            name: "CreateUser".into(),
            payload,
        }
    }

    #[tokio::test]
    async fn dispatches_valid_command_to_handler() {
        let registry = user_registry();
        let result = registry
            .dispatch(create_user_command(json!({
                "email": "test@example.com",
                "name": "John Doe"
            })))
            .await;

        let CommandResult::Success { position } = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(position.event_number, 1);
    }

    #[tokio::test]
    async fn invalid_payload_becomes_validation_error() {
        let registry = user_registry();
        let result = registry
            .dispatch(create_user_command(json!({
                "email": "invalid-email",
                "name": ""
            })))
            .await;

        let CommandResult::Failure {
            error:
                CommandError::Validation {
                    command_id,
                    command_name,
                    errors,
                },
        } = result
        else {
            panic!("expected validation failure, got {result:?}");
        };
        assert_eq!(command_id, "cmd-123");
        assert_eq!(command_name, "CreateUser");
        assert!(!errors.is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_becomes_validation_error() {
        let registry = user_registry();
        let result = registry
            .dispatch(create_user_command(json!({ "email": 42 })))
            .await;

        assert!(matches!(
            result,
            CommandResult::Failure {
                error: CommandError::Validation { .. }
            }
        ));
    }

    #[tokio::test]
    async fn unknown_name_lists_available_handlers() {
        let registry = user_registry();
        let result = registry
            .dispatch(WireCommand {
                id: "cmd-123".into(),
                target: "user-456".into(),
                name: "UnknownCommand".into(),
                payload: json!({}),
            })
            .await;

        let CommandResult::Failure {
            error:
                CommandError::HandlerNotFound {
                    command_name,
                    available_handlers,
                    ..
                },
        } = result
        else {
            panic!("expected handler-not-found, got {result:?}");
        };
        assert_eq!(command_name, "UnknownCommand");
        assert_eq!(available_handlers, vec!["CreateUser".to_string()]);
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let registry = CommandRegistry::builder()
            .define("CreateUser", |_cmd: DomainCommand<CreateUser>| async move {
                panic!("handler exploded");
            })
            .build()
            .unwrap();

        let result = registry
            .dispatch(create_user_command(json!({
                "email": "test@example.com",
                "name": "John Doe"
            })))
            .await;

        let CommandResult::Failure {
            error: CommandError::Unknown {
                command_id,
                message,
            },
        } = result
        else {
            panic!("expected unknown error, got {result:?}");
        };
        assert_eq!(command_id, "cmd-123");
        assert!(message.contains("handler exploded"));
    }

    #[tokio::test]
    async fn domain_failure_passes_through_unchanged() {
        let registry = CommandRegistry::builder()
            .define("CreateUser", |_cmd: DomainCommand<CreateUser>| async move {
                CommandResult::failure(CommandError::ConcurrencyConflict {
                    expected_version: 3,
                    actual_version: 5,
                })
            })
            .build()
            .unwrap();

        let result = registry
            .dispatch(create_user_command(json!({
                "email": "test@example.com",
                "name": "John Doe"
            })))
            .await;

        assert_eq!(
            result,
            CommandResult::failure(CommandError::ConcurrencyConflict {
                expected_version: 3,
                actual_version: 5,
            })
        );
    }

    #[test]
    fn duplicate_definition_is_rejected_at_build() {
        let built = CommandRegistry::builder()
            .define("CreateUser", |_cmd: DomainCommand<CreateUser>| async move {
                CommandResult::success(EventStreamPosition::new("user-123", 1))
            })
            .define("CreateUser", |_cmd: DomainCommand<CreateUser>| async move {
                CommandResult::success(EventStreamPosition::new("user-123", 2))
            })
            .build();

        assert!(matches!(
            built,
            Err(RegistryError::DuplicateCommand(name)) if name == "CreateUser"
        ));
    }
}
