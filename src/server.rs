//! The server hosts actors and mailboxes on one peer.
//!
//! [`Server::serve`] registers the peer under a coordinator lease, then runs
//! three loops as tasks: the lease keepalive, the leader election, and the
//! transport accept loop. It blocks until [`Server::stop`] or fatal lease
//! loss, cancels every actor context, waits out the grace period, and
//! deregisters everything it owns.
//!
//! # Lifecycle
//!
//! 1. **Idle**: definitions registered, nothing running.
//! 2. **Serving**: peer registered, RPCs dispatched, election racing.
//! 3. **Stopped**: contexts cancelled, names released, lease revoked.
//!
//! ```rust,ignore
//! let server = Server::new(coordinator, codec, ServerConfig::new("demo"))?;
//! server.register_def("leader", |_| Ok(Box::new(MyLeader)));
//! server.register_def("worker", |_| Ok(Box::new(MyWorker)));
//!
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! server.serve(listener).await?;
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actor::{Ack, ActorContext, ActorMaker, ActorStart, LEADER};
use crate::codec::{CodecRegistry, GridMessage};
use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::error::GridError;
use crate::mailbox::{Delivery, Mailbox, MailboxRoutes, ReplySink};
use crate::registry::{
    is_valid_name, Kind, RegistrationHandle, Registry, RegistryEvent, RegistrySession,
};
use crate::transport::{serve_connections, ReplyError, RequestDispatcher, WirePayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerLifecycle {
    Idle,
    Serving,
    Stopped,
}

struct ServeState {
    session: Arc<RegistrySession>,
    peer_name: String,
}

struct ActorHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Hosts actors and mailboxes on one peer. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    codec: Arc<CodecRegistry>,
    registry: Registry,
    makers: Mutex<HashMap<String, ActorMaker>>,
    routes: MailboxRoutes,
    actors: Arc<Mutex<HashMap<String, ActorHandle>>>,
    runtime: Mutex<Option<ServeState>>,
    shutdown: CancellationToken,
    state: Mutex<ServerLifecycle>,
}

impl Server {
    /// Create a server for one peer in `config.namespace()`.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        codec: Arc<CodecRegistry>,
        config: ServerConfig,
    ) -> Result<Self, GridError> {
        let registry = Registry::new(coordinator, config.namespace())?;
        if let Some(name) = config.peer_name() {
            if !is_valid_name(name) {
                return Err(GridError::InvalidName { name: name.into() });
            }
        }
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                codec,
                registry,
                makers: Mutex::new(HashMap::new()),
                routes: Arc::new(Mutex::new(HashMap::new())),
                actors: Arc::new(Mutex::new(HashMap::new())),
                runtime: Mutex::new(None),
                shutdown: CancellationToken::new(),
                state: Mutex::new(ServerLifecycle::Idle),
            }),
        })
    }

    /// The namespace this server registers under.
    pub fn namespace(&self) -> &str {
        self.inner.registry.namespace()
    }

    /// The registered peer name, while serving.
    pub fn peer_name(&self) -> Option<String> {
        self.inner
            .runtime
            .lock()
            .expect("server lock poisoned")
            .as_ref()
            .map(|state| state.peer_name.clone())
    }

    /// Associate an actor type with its constructor.
    ///
    /// The `"leader"` type is constructed by the election loop on whichever
    /// peer wins the race; every other type is constructed on demand when an
    /// [`ActorStart`] arrives for this peer.
    pub fn register_def<F>(&self, actor_type: impl Into<String>, maker: F)
    where
        F: Fn(&[u8]) -> Result<Box<dyn crate::actor::Actor>, GridError> + Send + Sync + 'static,
    {
        self.inner
            .makers
            .lock()
            .expect("server lock poisoned")
            .insert(actor_type.into(), Arc::new(maker));
    }

    /// Open a mailbox on this server. See [`Mailbox::open`].
    pub async fn open_mailbox(&self, name: &str, capacity: usize) -> Result<Mailbox, GridError> {
        if capacity == 0 {
            return Err(GridError::InvalidState(
                "mailbox capacity must be at least 1".into(),
            ));
        }
        if !is_valid_name(name) {
            return Err(GridError::InvalidName { name: name.into() });
        }
        let (session, _) = self.inner.serving_session()?;
        let (tx, rx) = mpsc::channel(capacity);
        {
            let mut routes = self.inner.routes.lock().expect("server lock poisoned");
            if routes.contains_key(name) {
                return Err(GridError::AlreadyRegistered {
                    kind: Kind::Mailbox,
                    name: name.into(),
                });
            }
            routes.insert(name.to_string(), tx);
        }
        match session.register(Kind::Mailbox, name).await {
            Ok(handle) => Ok(Mailbox::new(
                name.to_string(),
                rx,
                self.inner.routes.clone(),
                session,
                handle,
            )),
            Err(error) => {
                self.inner
                    .routes
                    .lock()
                    .expect("server lock poisoned")
                    .remove(name);
                Err(error)
            }
        }
    }

    /// Serve on `listener` until [`stop`](Self::stop) or fatal lease loss.
    ///
    /// Returns `Ok(())` after a graceful stop and
    /// `Err(GridError::LeaseLost)` when the coordinator lease expired.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GridError> {
        {
            let mut state = self.inner.state.lock().expect("server lock poisoned");
            match *state {
                ServerLifecycle::Idle => *state = ServerLifecycle::Serving,
                _ => {
                    return Err(GridError::InvalidState(
                        "server already started".into(),
                    ));
                }
            }
        }
        let result = self.inner.clone().run(listener).await;
        *self.inner.state.lock().expect("server lock poisoned") = ServerLifecycle::Stopped;
        result
    }

    /// Signal a graceful shutdown. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("namespace", &self.namespace())
            .field("peer_name", &self.peer_name())
            .finish()
    }
}

impl ServerInner {
    async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), GridError> {
        let local_addr = listener.local_addr()?;
        let address = local_addr.to_string();
        let peer_name = match self.config.peer_name() {
            Some(name) => name.to_string(),
            None => derive_peer_name(&local_addr),
        };

        let session = Arc::new(
            RegistrySession::start(
                self.registry.clone(),
                peer_name.clone(),
                address.clone(),
                self.config.lease_ttl(),
                self.config.keepalive_interval(),
            )
            .await?,
        );
        let peer_registration = match session.register(Kind::Peer, &peer_name).await {
            Ok(handle) => handle,
            Err(error) => {
                let _ = session.revoke().await;
                return Err(error);
            }
        };
        *self.runtime.lock().expect("server lock poisoned") = Some(ServeState {
            session: session.clone(),
            peer_name: peer_name.clone(),
        });
        info!(
            namespace = %self.registry.namespace(),
            peer = %peer_name,
            addr = %address,
            "peer registered; serving"
        );

        let mut tasks: JoinSet<Result<(), GridError>> = JoinSet::new();
        {
            let session = session.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move { session.keep_alive_loop(shutdown).await });
        }
        tasks.spawn(self.clone().election_loop(session.clone()));
        {
            let dispatcher: Arc<dyn RequestDispatcher> = self.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(serve_connections(listener, dispatcher, shutdown));
        }

        // Serve until stopped, or until a loop exits on its own; the only
        // loop that exits with an error before shutdown is the keepalive
        // when the lease is gone.
        let mut fatal: Option<GridError> = None;
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            finished = tasks.join_next() => match finished {
                Some(Ok(Err(error))) => fatal = Some(error),
                Some(Err(join_error)) => {
                    fatal = Some(GridError::InvalidState(format!(
                        "server task failed: {join_error}"
                    )));
                }
                Some(Ok(Ok(()))) | None => {}
            },
        }
        self.shutdown.cancel();

        self.stop_actors().await;
        while let Some(finished) = tasks.join_next().await {
            if let Ok(Err(error)) = finished {
                if fatal.is_none() {
                    fatal = Some(error);
                }
            }
        }

        let lease_lost = matches!(fatal, Some(GridError::LeaseLost));
        if lease_lost {
            warn!(peer = %peer_name, "lease lost; registrations already swept");
        } else {
            let _ = session.deregister(&peer_registration).await;
            if let Err(error) = session.revoke().await {
                debug!(%error, "lease revocation failed");
            }
        }

        *self.runtime.lock().expect("server lock poisoned") = None;
        self.routes.lock().expect("server lock poisoned").clear();
        info!(peer = %peer_name, "server stopped");
        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn serving_session(&self) -> Result<(Arc<RegistrySession>, String), GridError> {
        let runtime = self.runtime.lock().expect("server lock poisoned");
        match runtime.as_ref() {
            Some(state) => Ok((state.session.clone(), state.peer_name.clone())),
            None => Err(GridError::InvalidState("server is not serving".into())),
        }
    }

    /// Cancel every hosted actor and wait up to the grace period.
    async fn stop_actors(&self) {
        let handles: Vec<(String, ActorHandle)> = {
            let mut actors = self.actors.lock().expect("server lock poisoned");
            actors.drain().collect()
        };
        for (_, handle) in &handles {
            handle.token.cancel();
        }
        let deadline = tokio::time::Instant::now() + self.config.stop_grace();
        for (name, handle) in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle.join).await.is_err() {
                warn!(actor = %name, "actor did not stop within the grace period");
            }
        }
    }

    /// Race for the singleton leader registration; run the leader when won,
    /// watch for the next vacancy when lost.
    async fn election_loop(self: Arc<Self>, session: Arc<RegistrySession>) -> Result<(), GridError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            match session.register(Kind::Actor, LEADER).await {
                Ok(registration) => {
                    info!(peer = %session.owner(), "won leader election");
                    self.run_leader(&session, registration).await;
                }
                Err(GridError::AlreadyRegistered { .. }) => {
                    self.await_leader_vacancy().await;
                }
                Err(GridError::LeaseLost) => return Err(GridError::LeaseLost),
                Err(error) => {
                    warn!(%error, "leader claim failed");
                    self.pause(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Block until the current leader registration disappears.
    async fn await_leader_vacancy(&self) {
        let mut watch = match self.registry.watch(Kind::Actor).await {
            Ok(watch) => watch,
            Err(error) => {
                warn!(%error, "leader watch failed");
                self.pause(Duration::from_secs(1)).await;
                return;
            }
        };
        // The registration may have vanished between the lost race and the
        // watch starting; re-check before trusting the event stream.
        match self.registry.find(Kind::Actor, LEADER).await {
            Err(GridError::NotFound { .. }) => return,
            Ok(_) | Err(_) => {}
        }
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = watch.next() => match event {
                    Some(RegistryEvent::Removed { name, .. }) if name == LEADER => return,
                    Some(_) => {}
                    None => {
                        self.pause(Duration::from_millis(500)).await;
                        return;
                    }
                },
            }
        }
    }

    /// Construct and run the leader actor, releasing the registration when
    /// it ends. A peer with no leader definition yields so another can win.
    async fn run_leader(
        self: &Arc<Self>,
        session: &Arc<RegistrySession>,
        registration: RegistrationHandle,
    ) {
        let maker = self
            .makers
            .lock()
            .expect("server lock poisoned")
            .get(LEADER)
            .cloned();
        let Some(maker) = maker else {
            warn!("no leader definition registered; yielding leadership");
            let _ = session.deregister(&registration).await;
            self.pause(Duration::from_secs(1)).await;
            return;
        };
        let mut actor = match maker(&[]) {
            Ok(actor) => actor,
            Err(error) => {
                warn!(%error, "leader construction failed");
                let _ = session.deregister(&registration).await;
                self.pause(Duration::from_secs(1)).await;
                return;
            }
        };

        let token = self.shutdown.child_token();
        let ctx = ActorContext::new(
            LEADER.to_string(),
            self.registry.namespace().to_string(),
            session.owner().to_string(),
            token,
        );
        info!(peer = %session.owner(), "leader started");
        let mut act_task = tokio::spawn(async move { actor.act(ctx).await });
        tokio::select! {
            result = &mut act_task => {
                if let Err(error) = result {
                    warn!(%error, "leader actor failed");
                }
            }
            _ = self.shutdown.cancelled() => {
                let grace = self.config.stop_grace();
                if tokio::time::timeout(grace, &mut act_task).await.is_err() {
                    warn!("leader did not stop within the grace period");
                }
            }
        }
        let _ = session.deregister(&registration).await;
        info!(peer = %session.owner(), "leader ended");
    }

    /// Register and spawn one actor on this peer.
    async fn spawn_actor(&self, start: ActorStart) -> Result<(), GridError> {
        let (session, peer_name) = self.serving_session()?;
        if !is_valid_name(&start.name) {
            return Err(GridError::InvalidName { name: start.name });
        }
        let maker = self
            .makers
            .lock()
            .expect("server lock poisoned")
            .get(&start.actor_type)
            .cloned()
            .ok_or_else(|| {
                GridError::InvalidState(format!(
                    "no actor definition for type {:?}",
                    start.actor_type
                ))
            })?;

        let registration = session.register(Kind::Actor, &start.name).await?;
        let mut actor = match maker(&start.data) {
            Ok(actor) => actor,
            Err(error) => {
                let _ = session.deregister(&registration).await;
                return Err(error);
            }
        };

        let token = self.shutdown.child_token();
        let ctx = ActorContext::new(
            start.name.clone(),
            self.registry.namespace().to_string(),
            peer_name,
            token.clone(),
        );
        let name = start.name.clone();
        let actors = self.actors.clone();
        let join = tokio::spawn(async move {
            debug!(actor = %name, "actor started");
            // A panicking actor must still release its registration.
            let act_task = tokio::spawn(async move { actor.act(ctx).await });
            match act_task.await {
                Ok(()) => debug!(actor = %name, "actor ended"),
                Err(error) => warn!(actor = %name, %error, "actor failed"),
            }
            let _ = session.deregister(&registration).await;
            actors.lock().expect("server lock poisoned").remove(&name);
        });
        self.actors
            .lock()
            .expect("server lock poisoned")
            .insert(start.name, ActorHandle { token, join });
        Ok(())
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Placement entry point for requests addressed to this peer.
    async fn place_actor(&self, start: ActorStart) -> Result<(), ReplyError> {
        if start.name == LEADER || start.actor_type == LEADER {
            return Err(ReplyError::InvalidName { name: start.name });
        }
        self.spawn_actor(start).await.map_err(|error| match error {
            GridError::AlreadyRegistered { name, .. } => ReplyError::AlreadyRegistered { name },
            GridError::InvalidName { name } => ReplyError::InvalidName { name },
            other => ReplyError::Internal(other.to_string()),
        })
    }
}

#[async_trait]
impl RequestDispatcher for ServerInner {
    async fn dispatch(
        &self,
        receiver: String,
        type_tag: String,
        body: Vec<u8>,
    ) -> Result<WirePayload, ReplyError> {
        let peer_name = match self.serving_session() {
            Ok((_, peer_name)) => peer_name,
            Err(_) => return Err(ReplyError::Internal("server is shutting down".into())),
        };

        // The peer's own name doubles as the placement endpoint.
        if receiver == peer_name {
            if type_tag != ActorStart::type_tag() {
                return Err(ReplyError::Internal(format!(
                    "peer accepts only actor start requests, got {type_tag:?}"
                )));
            }
            let start: ActorStart = serde_json::from_slice(&body)
                .map_err(|error| ReplyError::Internal(format!("malformed actor start: {error}")))?;
            info!(actor = %start.name, actor_type = %start.actor_type, "placement requested");
            self.place_actor(start).await?;
            let body = serde_json::to_vec(&Ack)
                .map_err(|error| ReplyError::Internal(error.to_string()))?;
            return Ok(WirePayload {
                type_tag: Ack::type_tag().to_string(),
                body,
            });
        }

        let queue = self
            .routes
            .lock()
            .expect("server lock poisoned")
            .get(&receiver)
            .cloned();
        let Some(queue) = queue else {
            return Err(ReplyError::NotFound);
        };
        let msg = self
            .codec
            .decode(&type_tag, &body)
            .map_err(|error| match error {
                GridError::UnknownType { tag } => ReplyError::UnknownType { tag },
                other => ReplyError::Internal(other.to_string()),
            })?;

        let (tx, rx) = oneshot::channel();
        let delivery = Delivery::new(msg, ReplySink::new(tx));
        match queue.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(ReplyError::MailboxFull),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(ReplyError::NotFound),
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ReplyError::Dropped),
        }
    }
}

/// Host-derived peer identity: the bound address with its separators folded
/// into the registry's name alphabet.
fn derive_peer_name(addr: &SocketAddr) -> String {
    let folded: String = addr
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("peer-{folded}")
}
