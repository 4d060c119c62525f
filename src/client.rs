//! Client for streaming chat turns and live sessions
//!
//! [`Client`] ties the pieces together: it owns the [`ConversationStore`], a
//! [`ChatTransport`] for `POST /chat/stream` and `POST /chat`, and a [`LiveConnector`]
//! for `/live`. Every call takes `&self`, so a client can be shared behind an `Arc`
//! and stopped from another task while a turn is streaming.
//!
//! ## Request Flow
//!
//! ```text
//! send(conversation, prompt)
//!     │
//!     ├─> Request built from history + prompt (fails fast, nothing appended)
//!     │
//!     ├─> User turn and empty model placeholder appended (AlreadyInFlight if busy)
//!     │
//!     ├─> POST /chat/stream
//!     │
//!     ├─> Frames folded into the placeholder, one snapshot per frame
//!     │
//!     └─> Terminal turn published: Finalized, Aborted or Errored
//! ```
//!
//! ## Stopping a Turn
//!
//! [`Client::stop`] fires the abort handle of the conversation's in-flight turn. The
//! transport stops yielding, queued frames are discarded, and the turn ends `Aborted`
//! with everything folded so far plus a stop marker.
//!
//! ```rust,no_run
//! # use apsara_stream::{ChatOptions, Client};
//! # use std::sync::Arc;
//! # async fn example() -> apsara_stream::Result<()> {
//! let client = Arc::new(Client::new(
//!     ChatOptions::builder()
//!         .model("gemini-2.0-flash")
//!         .base_url("http://localhost:9000")
//!         .build()?,
//! )?);
//! let conversation = client.create_conversation().await;
//!
//! let stopper = client.clone();
//! let id = conversation.clone();
//! tokio::spawn(async move {
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     stopper.stop(&id);
//! });
//!
//! let outcome = client.send(&conversation, "Write a long story", Vec::new()).await?;
//! println!("{:?}: {}", outcome.state, outcome.turn.text());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Failures that belong to the turn (transport errors, protocol violations, unusable
//! responses) come back as `Ok` with an `Errored` outcome, since the error turn is
//! already in the conversation. `Err` is reserved for calls that never started a turn:
//! unknown conversation, empty prompt, or [`Error::AlreadyInFlight`].

use crate::session::{TurnDriver, TurnOutcome};
use crate::store::{ConversationStore, TurnSnapshot};
use crate::transport::{AbortHandle, ChatTransport, HttpTransport, LiveConnector, WsConnector};
use crate::types::{
    ChatOptions, ChatRequest, FileData, LiveOptions, Part, RequestConfig, Role, Turn,
};
use crate::live::LiveSession;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sends a single prompt in a fresh conversation and waits for the finished turn.
///
/// # Examples
///
/// ```rust,no_run
/// use apsara_stream::{ChatOptions, query};
///
/// # async fn example() -> apsara_stream::Result<()> {
/// let options = ChatOptions::builder()
///     .model("gemini-2.0-flash")
///     .base_url("http://localhost:9000")
///     .build()?;
///
/// let outcome = query("What's the capital of France?", &options).await?;
/// println!("{}", outcome.turn.text());
/// # Ok(())
/// # }
/// ```
pub async fn query(prompt: &str, options: &ChatOptions) -> Result<TurnOutcome> {
    let client = Client::new(options.clone())?;
    let conversation = client.create_conversation().await;
    client.send(&conversation, prompt, Vec::new()).await
}

/// Multi-conversation chat client
pub struct Client {
    options: ChatOptions,

    /// Shared with every turn driver. Never locked across a network read.
    store: Arc<Mutex<ConversationStore>>,

    transport: Arc<dyn ChatTransport>,

    connector: Arc<dyn LiveConnector>,

    /// Abort handles of in-flight turns, by conversation id
    active: StdMutex<HashMap<String, AbortHandle>>,
}

impl Client {
    /// Creates a client talking to `options.base_url` over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(options: ChatOptions) -> Result<Self> {
        let transport = HttpTransport::new(
            options.base_url.clone(),
            Duration::from_secs(options.timeout),
        )?;
        Ok(Self::with_transport(options, Arc::new(transport)))
    }

    /// Creates a client over any transport
    pub fn with_transport(options: ChatOptions, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            options,
            store: Arc::new(Mutex::new(ConversationStore::new())),
            transport,
            connector: Arc::new(WsConnector),
            active: StdMutex::new(HashMap::new()),
        }
    }

    /// Replaces the conversation store, e.g. one loaded from persistence
    pub fn with_store(mut self, store: ConversationStore) -> Self {
        self.store = Arc::new(Mutex::new(store));
        self
    }

    pub fn with_live_connector(mut self, connector: Arc<dyn LiveConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    /// The shared store, for listing, renaming, pinning and deleting conversations
    pub fn store(&self) -> Arc<Mutex<ConversationStore>> {
        self.store.clone()
    }

    /// Creates an untitled conversation on the configured model
    pub async fn create_conversation(&self) -> String {
        self.store
            .lock()
            .await
            .create_conversation(self.options.model.clone())
    }

    /// Receives every turn snapshot from now on
    pub async fn subscribe(&self) -> UnboundedReceiverStream<TurnSnapshot> {
        self.store.lock().await.subscribe()
    }

    /// Streams a model reply to `prompt` (plus any uploaded files).
    ///
    /// Resolves once the turn is terminal.
    pub async fn send(
        &self,
        conversation_id: &str,
        prompt: &str,
        files: Vec<FileData>,
    ) -> Result<TurnOutcome> {
        let user_turn = user_turn(prompt, files)?;
        let (request, placeholder) = {
            let mut store = self.store.lock().await;
            if store.is_in_flight(conversation_id) {
                return Err(Error::already_in_flight(conversation_id));
            }
            let mut history = store.history_for_request(conversation_id)?;
            history.push(user_turn.clone());
            let request = self.build_request(&store, conversation_id, &history)?;
            let placeholder = store.start_turn(conversation_id, user_turn)?;
            (request, placeholder)
        };

        self.stream_turn(conversation_id, placeholder, Ok(request)).await
    }

    /// Replaces a model turn (and everything after it) with a fresh reply
    pub async fn regenerate(&self, conversation_id: &str, model_turn_id: &str) -> Result<TurnOutcome> {
        let (request, placeholder) = {
            let mut store = self.store.lock().await;
            let placeholder = store.start_regeneration(conversation_id, model_turn_id)?;
            let request = store
                .history_for_request(conversation_id)
                .and_then(|history| self.build_request(&store, conversation_id, &history));
            (request, placeholder)
        };

        self.stream_turn(conversation_id, placeholder, request).await
    }

    /// Sends `prompt` without streaming (`POST /chat`), folding the full response
    pub async fn chat(
        &self,
        conversation_id: &str,
        prompt: &str,
        files: Vec<FileData>,
    ) -> Result<TurnOutcome> {
        let user_turn = user_turn(prompt, files)?;
        let (request, placeholder) = {
            let mut store = self.store.lock().await;
            if store.is_in_flight(conversation_id) {
                return Err(Error::already_in_flight(conversation_id));
            }
            let mut history = store.history_for_request(conversation_id)?;
            history.push(user_turn.clone());
            let request = self.build_request(&store, conversation_id, &history)?;
            let placeholder = store.start_turn(conversation_id, user_turn)?;
            (request, placeholder)
        };

        let driver = TurnDriver::new(self.store.clone(), conversation_id, placeholder);
        match self.transport.complete(&request).await {
            Ok(body) => driver.complete(&body).await,
            Err(e) => driver.fail_open(e).await,
        }
    }

    /// Stops the conversation's in-flight turn. Returns false if nothing was streaming.
    pub fn stop(&self, conversation_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(conversation_id) {
            Some(handle) => {
                log::info!("Stopping turn for {}", conversation_id);
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort handle of the conversation's in-flight turn, if any
    pub fn abort_handle(&self, conversation_id: &str) -> Option<AbortHandle> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.get(conversation_id).cloned()
    }

    /// A live session using this client's connector
    pub fn live_session(&self, options: LiveOptions) -> LiveSession {
        LiveSession::with_connector(options, self.connector.clone())
    }

    fn build_request(
        &self,
        store: &ConversationStore,
        conversation_id: &str,
        history: &[Turn],
    ) -> Result<ChatRequest> {
        let model = store
            .get(conversation_id)
            .map(|c| c.model.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.options.model.clone());
        let config = RequestConfig::from_options(&self.options, &model);
        ChatRequest::new(model, history, config)
    }

    async fn stream_turn(
        &self,
        conversation_id: &str,
        placeholder: Turn,
        request: Result<ChatRequest>,
    ) -> Result<TurnOutcome> {
        let abort = AbortHandle::new();
        let _active = ActiveTurn::register(&self.active, conversation_id, abort.clone());

        let driver = TurnDriver::new(self.store.clone(), conversation_id, placeholder);
        match request {
            Ok(request) => match self.transport.open(&request, abort).await {
                Ok(source) => driver.run(source).await,
                Err(e) => driver.fail_open(e).await,
            },
            Err(e) => driver.fail_open(e).await,
        }
    }
}

/// Keeps a turn's abort handle registered for as long as its future lives
struct ActiveTurn<'a> {
    active: &'a StdMutex<HashMap<String, AbortHandle>>,
    conversation_id: String,
}

impl<'a> ActiveTurn<'a> {
    fn register(
        active: &'a StdMutex<HashMap<String, AbortHandle>>,
        conversation_id: &str,
        abort: AbortHandle,
    ) -> Self {
        active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conversation_id.to_string(), abort);
        Self {
            active,
            conversation_id: conversation_id.to_string(),
        }
    }
}

impl Drop for ActiveTurn<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.conversation_id);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn user_turn(prompt: &str, files: Vec<FileData>) -> Result<Turn> {
    let prompt = prompt.trim();
    if prompt.is_empty() && files.is_empty() {
        return Err(Error::invalid_input("prompt cannot be empty"));
    }

    let mut parts = Vec::with_capacity(files.len() + 1);
    if !prompt.is_empty() {
        parts.push(Part::text(prompt));
    }
    parts.extend(files.into_iter().map(Part::FileData));
    Ok(Turn::new(Role::User, parts))
}
