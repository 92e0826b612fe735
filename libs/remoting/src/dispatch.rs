//! Dispatch Table
//!
//! One entry per remote-callable method: deserialize the arguments,
//! invoke the actor implementation, serialize the result-or-error reply.
//! Registration is an ordinary builder over typed closures: each
//! interface member maps to exactly one wire message pair, keyed by its
//! unique method name.
//!
//! Serialized dispatch enqueues on the target actor *before* returning
//! the pending future, so requests from one connection enter the actor's
//! queue in arrival order even though their replies are awaited
//! concurrently.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use actors::{Actor, ActorRef};
use bytes::Bytes;
use codec::{ReplyEnvelope, Serializer};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::observable::ObservableChannel;
use crate::session::{with_current, with_current_sync, ActorSession};

/// Whether a dispatched call goes through the actor's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    /// Post through the actor's executor (the default)
    Serialized,
    /// Run on the calling I/O task; serialization is the caller's problem
    Direct,
}

/// When session injection is on, the session is bound around the method
/// body itself (inside the actor's executor for serialized dispatch) so
/// [`ActorSession::current`] works where the user code runs and nothing
/// leaks past the single call.
type MethodHandler<S> = Arc<
    dyn Fn(
            Arc<S>,
            Bytes,
            DispatchMode,
            Option<ActorSession>,
        ) -> Result<BoxFuture<'static, Bytes>>
        + Send
        + Sync,
>;

type ObservableSpawn<S> = Box<dyn Fn(Arc<S>, mpsc::Sender<Bytes>) + Send + Sync>;

struct ObservableBinding<S> {
    name: String,
    spawn: ObservableSpawn<S>,
}

/// Method-name → handler mapping for one served interface
pub struct DispatchTable<S: Serializer> {
    methods: HashMap<String, MethodHandler<S>>,
    observables: Vec<ObservableBinding<S>>,
}

impl<S: Serializer> Default for DispatchTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Serializer> DispatchTable<S> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            observables: Vec::new(),
        }
    }

    /// Register a synchronous method backed by `actor`
    ///
    /// The closure's error turns into the reply envelope's error message;
    /// it never tears down the connection.
    pub fn method<A, Args, R, E, F>(mut self, name: &str, actor: &ActorRef<A>, f: F) -> Self
    where
        A: Actor,
        Args: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(&mut A, Args) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let actor = actor.clone();
        let f = Arc::new(f);
        let handler: MethodHandler<S> = Arc::new(move |serializer, args_bytes, mode, session| {
            let args: Args = serializer.from_bytes(&args_bytes)?;
            let f = Arc::clone(&f);
            let invoke = move |a: &mut A| match session {
                Some(session) => with_current_sync(session, || (*f)(a, args)),
                None => (*f)(a, args),
            };
            match mode {
                DispatchMode::Serialized => match actor.enqueue(invoke) {
                    Ok(pending) => Ok(async move {
                        let envelope = match pending.await {
                            Ok(Ok(value)) => ReplyEnvelope::ok(value),
                            Ok(Err(app_err)) => ReplyEnvelope::err(app_err.to_string()),
                            Err(exec_err) => ReplyEnvelope::err(exec_err.to_string()),
                        };
                        encode_reply(&*serializer, envelope)
                    }
                    .boxed()),
                    Err(actor_err) => {
                        let message = actor_err.to_string();
                        Ok(async move {
                            encode_reply(&*serializer, ReplyEnvelope::<R>::err(message))
                        }
                        .boxed())
                    }
                },
                DispatchMode::Direct => {
                    let actor = actor.clone();
                    Ok(async move {
                        let envelope = match actor.invoke_direct(invoke).await {
                            Ok(value) => ReplyEnvelope::ok(value),
                            Err(app_err) => ReplyEnvelope::err(app_err.to_string()),
                        };
                        encode_reply(&*serializer, envelope)
                    }
                    .boxed())
                }
            }
        });
        self.insert_method(name, handler);
        self
    }

    /// Register an async method backed by `actor`. The body runs inside
    /// the actor's executor; awaits in it re-enter through its queue.
    pub fn method_async<A, Args, R, E, F>(mut self, name: &str, actor: &ActorRef<A>, f: F) -> Self
    where
        A: Actor,
        Args: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: for<'a> Fn(&'a mut A, Args) -> BoxFuture<'a, std::result::Result<R, E>>
            + Send
            + Sync
            + 'static,
    {
        let actor = actor.clone();
        let f = Arc::new(f);
        let handler: MethodHandler<S> = Arc::new(move |serializer, args_bytes, mode, session| {
            let args: Args = serializer.from_bytes(&args_bytes)?;
            let f = Arc::clone(&f);
            let invoke = move |a: &mut A| {
                let body = (*f)(a, args);
                match session {
                    Some(session) => with_current(session, body).boxed(),
                    None => body,
                }
            };
            match mode {
                DispatchMode::Serialized => match actor.enqueue_async(invoke) {
                    Ok(pending) => Ok(async move {
                        let envelope = match pending.await {
                            Ok(Ok(value)) => ReplyEnvelope::ok(value),
                            Ok(Err(app_err)) => ReplyEnvelope::err(app_err.to_string()),
                            Err(exec_err) => ReplyEnvelope::err(exec_err.to_string()),
                        };
                        encode_reply(&*serializer, envelope)
                    }
                    .boxed()),
                    Err(actor_err) => {
                        let message = actor_err.to_string();
                        Ok(async move {
                            encode_reply(&*serializer, ReplyEnvelope::<R>::err(message))
                        }
                        .boxed())
                    }
                },
                DispatchMode::Direct => {
                    let actor = actor.clone();
                    Ok(async move {
                        let envelope = match actor.invoke_direct_async(invoke).await {
                            Ok(value) => ReplyEnvelope::ok(value),
                            Err(app_err) => ReplyEnvelope::err(app_err.to_string()),
                        };
                        encode_reply(&*serializer, envelope)
                    }
                    .boxed())
                }
            }
        });
        self.insert_method(name, handler);
        self
    }

    /// Bind a named observable stream: every value published on `channel`
    /// is broadcast to all connected clients.
    pub fn observable<T>(mut self, name: &str, channel: &ObservableChannel<T>) -> Self
    where
        T: Serialize + Clone + Send + 'static,
    {
        let stream_name = name.to_string();
        let channel = channel.clone();
        self.observables.push(ObservableBinding {
            name: stream_name.clone(),
            spawn: Box::new(move |serializer: Arc<S>, sink: mpsc::Sender<Bytes>| {
                let mut rx = channel.raw_subscribe();
                let name = stream_name.clone();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(value) => {
                                let bytes = match serializer.to_bytes(&value) {
                                    Ok(bytes) => bytes,
                                    Err(e) => {
                                        warn!(stream = %name, error = %e, "observable value failed to serialize");
                                        continue;
                                    }
                                };
                                let frame = codec::ObservableFrame::new(name.clone(), bytes).encode();
                                if sink.send(frame).await.is_err() {
                                    // Server gone.
                                    return;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(stream = %name, skipped, "observable forwarder lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                debug!(stream = %name, "observable channel closed");
                                return;
                            }
                        }
                    }
                });
            }),
        });
        self
    }

    /// Run the named handler: decode, invoke, and return the future that
    /// resolves to the encoded reply envelope. `None` when no handler is
    /// registered under the name; `Some(Err(..))` when the arguments were
    /// undecodable (a protocol violation).
    pub(crate) fn dispatch(
        &self,
        method: &str,
        serializer: Arc<S>,
        args: Bytes,
        mode: DispatchMode,
        session: Option<ActorSession>,
    ) -> Option<Result<BoxFuture<'static, Bytes>>> {
        let handler = self.methods.get(method)?;
        Some((handler.as_ref())(serializer, args, mode, session))
    }

    /// Registered method names
    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    /// Start one forwarder task per bound observable
    pub(crate) fn spawn_observables(&self, serializer: Arc<S>, sink: mpsc::Sender<Bytes>) {
        for binding in &self.observables {
            debug!(stream = %binding.name, "starting observable forwarder");
            (binding.spawn)(Arc::clone(&serializer), sink.clone());
        }
    }

    fn insert_method(&mut self, name: &str, handler: MethodHandler<S>) {
        if self.methods.insert(name.to_string(), handler).is_some() {
            // Method names must be unique; the last registration wins but
            // the collision is almost certainly a bug upstream.
            warn!(method = name, "duplicate method registration replaced");
        }
    }
}

fn encode_reply<S, R>(serializer: &S, envelope: ReplyEnvelope<R>) -> Bytes
where
    S: Serializer + ?Sized,
    R: Serialize,
{
    match serializer.to_bytes(&envelope) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            warn!(error = %e, "reply serialization failed");
            let fallback = ReplyEnvelope::<()>::err(e.to_string());
            Bytes::from(serializer.to_bytes(&fallback).unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actors::{ActorSystem, CreateOptions};
    use async_trait::async_trait;
    use codec::BincodeSerializer;

    #[derive(Default)]
    struct Adder {
        calls: u32,
    }

    #[async_trait]
    impl Actor for Adder {}

    async fn run_handler(
        table: &DispatchTable<BincodeSerializer>,
        method: &str,
        args: impl Serialize,
        mode: DispatchMode,
    ) -> ReplyEnvelope<i32> {
        let serializer = Arc::new(BincodeSerializer);
        let args = Bytes::from(serializer.to_bytes(&args).unwrap());
        let reply = table
            .dispatch(method, Arc::clone(&serializer), args, mode, None)
            .unwrap()
            .unwrap()
            .await;
        serializer.from_bytes(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_method_dispatches_through_the_actor() {
        let system = ActorSystem::new();
        let adder = system
            .create_actor(Adder::default, CreateOptions::named("adder"))
            .await
            .unwrap();
        let table = DispatchTable::<BincodeSerializer>::new().method(
            "Add",
            &adder,
            |actor: &mut Adder, (a, b): (i32, i32)| {
                actor.calls += 1;
                Ok::<_, String>(a + b)
            },
        );

        let reply = run_handler(&table, "Add", (2, 3), DispatchMode::Serialized).await;
        assert_eq!(reply.into_result(), Ok(5));
        assert_eq!(adder.ask(|a| a.calls).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_application_error_lands_in_the_envelope() {
        let system = ActorSystem::new();
        let adder = system
            .create_actor(Adder::default, CreateOptions::named("div"))
            .await
            .unwrap();
        let table = DispatchTable::<BincodeSerializer>::new().method(
            "Divide",
            &adder,
            |_: &mut Adder, (a, b): (i32, i32)| {
                if b == 0 {
                    Err("Attempted to divide by zero".to_string())
                } else {
                    Ok(a / b)
                }
            },
        );

        let reply = run_handler(&table, "Divide", (1, 0), DispatchMode::Serialized).await;
        assert_eq!(
            reply.into_result(),
            Err("Attempted to divide by zero".to_string())
        );
    }

    #[tokio::test]
    async fn test_undecodable_args_are_a_protocol_error() {
        let system = ActorSystem::new();
        let adder = system
            .create_actor(Adder::default, CreateOptions::named("strict"))
            .await
            .unwrap();
        let table = DispatchTable::<BincodeSerializer>::new().method(
            "Add",
            &adder,
            |_: &mut Adder, (a, b): (i32, i32)| Ok::<_, String>(a + b),
        );

        let serializer = Arc::new(BincodeSerializer);
        let result = table
            .dispatch(
                "Add",
                serializer,
                Bytes::from_static(&[0xff]),
                DispatchMode::Serialized,
                None,
            )
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_direct_mode_bypasses_the_queue() {
        let system = ActorSystem::new();
        let adder = system
            .create_actor(Adder::default, CreateOptions::named("direct"))
            .await
            .unwrap();
        let table = DispatchTable::<BincodeSerializer>::new().method(
            "Add",
            &adder,
            |_: &mut Adder, (a, b): (i32, i32)| Ok::<_, String>(a + b),
        );

        let reply = run_handler(&table, "Add", (4, 4), DispatchMode::Direct).await;
        assert_eq!(reply.into_result(), Ok(8));
    }

    #[tokio::test]
    async fn test_stopped_actor_yields_error_reply_not_connection_loss() {
        let system = ActorSystem::new();
        let adder = system
            .create_actor(Adder::default, CreateOptions::named("gone"))
            .await
            .unwrap();
        let table = DispatchTable::<BincodeSerializer>::new().method(
            "Add",
            &adder,
            |_: &mut Adder, (a, b): (i32, i32)| Ok::<_, String>(a + b),
        );
        adder.stop().await;

        let reply = run_handler(&table, "Add", (2, 2), DispatchMode::Serialized).await;
        assert!(reply.into_result().is_err());
    }
}
