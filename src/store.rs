//! Conversation store: ordered turns per conversation and snapshot publishing.
//!
//! The store owns every [`Conversation`]. Accumulators never hand it mutable access to
//! their working turn. They publish copies through [`ConversationStore::apply_turn_snapshot`],
//! and each copy goes out to subscribers as a fresh `Arc<Turn>`, so two snapshots never
//! share an instance and a reader can never see a half-applied update.
//!
//! At most one turn per conversation may be in flight. [`ConversationStore::start_turn`]
//! fails with [`Error::AlreadyInFlight`] while another turn of the same conversation is
//! still accumulating, leaving that turn untouched.
//!
//! Persistence belongs to a [`ConversationSink`]. The store's only write contract with it
//! is "append this terminal turn" (plus truncation when a turn is regenerated).

use crate::accumulator::TurnState;
use crate::config::{NEW_CHAT_TITLE, title_from_prompt};
use crate::types::{Conversation, Role, Turn};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Immutable copy of a turn as published to subscribers
#[derive(Debug, Clone)]
pub struct TurnSnapshot {
    pub conversation_id: String,
    pub turn: Arc<Turn>,
    pub state: TurnState,
}

/// Persistence collaborator
pub trait ConversationSink: Send + Sync {
    /// Records a turn that will not change again
    fn append_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()>;

    /// Drops persisted turns from index `len` onward
    fn truncate(&self, _conversation_id: &str, _len: usize) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySink {
    turns: Mutex<HashMap<String, Vec<Turn>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted turns of one conversation
    pub fn turns(&self, conversation_id: &str) -> Vec<Turn> {
        self.turns
            .lock()
            .map(|turns| turns.get(conversation_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl ConversationSink for MemorySink {
    fn append_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()> {
        let mut turns = self
            .turns
            .lock()
            .map_err(|_| Error::config("memory sink lock poisoned"))?;
        turns
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    fn truncate(&self, conversation_id: &str, len: usize) -> Result<()> {
        let mut turns = self
            .turns
            .lock()
            .map_err(|_| Error::config("memory sink lock poisoned"))?;
        if let Some(list) = turns.get_mut(conversation_id) {
            list.truncate(len);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    turn_id: String,
    state: TurnState,
}

/// Owner of all conversations and their in-flight turns
#[derive(Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    in_flight: HashMap<String, InFlight>,
    subscribers: Vec<mpsc::UnboundedSender<TurnSnapshot>>,
    sink: Option<Arc<dyn ConversationSink>>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("conversations", &self.conversations.len())
            .field("in_flight", &self.in_flight.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn ConversationSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    /// Replaces the store's contents with previously persisted conversations
    pub fn load(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
        self.in_flight.clear();
        self.sort_pinned_first();
    }

    /// Receives every snapshot published from now on
    pub fn subscribe(&mut self) -> UnboundedReceiverStream<TurnSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    // ------------------------------------------------------------------------
    // Conversation management
    // ------------------------------------------------------------------------

    /// Creates an untitled conversation, placed right after the pinned ones
    pub fn create_conversation(&mut self, model: impl Into<String>) -> String {
        let conversation = Conversation::untitled(model);
        let id = conversation.id.clone();
        let index = self.conversations.iter().take_while(|c| c.pinned).count();
        self.conversations.insert(index, conversation);
        log::debug!("Created conversation {}", id);
        id
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    /// All conversations, pinned first
    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn rename(&mut self, conversation_id: &str, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::invalid_input("title cannot be empty"));
        }
        let conversation = self.get_mut(conversation_id)?;
        conversation.title = title.to_string();
        Ok(())
    }

    /// Flips the pinned flag and returns the new value
    pub fn toggle_pin(&mut self, conversation_id: &str) -> Result<bool> {
        let conversation = self.get_mut(conversation_id)?;
        conversation.pinned = !conversation.pinned;
        let pinned = conversation.pinned;
        self.sort_pinned_first();
        Ok(pinned)
    }

    /// Removes a conversation. Refused while one of its turns is streaming.
    pub fn delete(&mut self, conversation_id: &str) -> Result<Conversation> {
        if self.in_flight.contains_key(conversation_id) {
            return Err(Error::already_in_flight(conversation_id));
        }
        let index = self
            .conversations
            .iter()
            .position(|c| c.id == conversation_id)
            .ok_or_else(|| Error::not_found(format!("conversation {}", conversation_id)))?;
        Ok(self.conversations.remove(index))
    }

    // ------------------------------------------------------------------------
    // Turn lifecycle
    // ------------------------------------------------------------------------

    pub fn is_in_flight(&self, conversation_id: &str) -> bool {
        self.in_flight.contains_key(conversation_id)
    }

    /// State of the conversation's in-flight turn, if any
    pub fn in_flight_state(&self, conversation_id: &str) -> Option<TurnState> {
        self.in_flight.get(conversation_id).map(|f| f.state)
    }

    /// Appends `user_turn` and an empty model placeholder, returning the placeholder
    /// turn to accumulate into.
    pub fn start_turn(&mut self, conversation_id: &str, user_turn: Turn) -> Result<Turn> {
        self.ensure_idle(conversation_id)?;

        let conversation = self.get_mut(conversation_id)?;
        conversation.messages.push(user_turn.clone());
        let placeholder = Turn::model(Vec::new());
        conversation.messages.push(placeholder.clone());

        self.persist(conversation_id, &user_turn);
        self.begin(conversation_id, &placeholder);
        Ok(placeholder)
    }

    /// Truncates the conversation at `model_turn_id` and starts a fresh placeholder in
    /// its position. Everything from that turn onward is discarded.
    pub fn start_regeneration(&mut self, conversation_id: &str, model_turn_id: &str) -> Result<Turn> {
        self.ensure_idle(conversation_id)?;

        let conversation = self.get_mut(conversation_id)?;
        let position = conversation
            .position(model_turn_id)
            .ok_or_else(|| Error::not_found(format!("turn {}", model_turn_id)))?;
        if !matches!(conversation.messages[position].role, Role::Model | Role::Error) {
            return Err(Error::invalid_input("only model turns can be regenerated"));
        }
        if !conversation.messages[..position]
            .iter()
            .any(|t| t.role == Role::User)
        {
            return Err(Error::invalid_input("no user turn precedes this turn"));
        }

        conversation.messages.truncate(position);
        let placeholder = Turn::model(Vec::new());
        conversation.messages.push(placeholder.clone());
        log::debug!(
            "Regenerating turn {} of conversation {} at position {}",
            model_turn_id,
            conversation_id,
            position
        );

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.truncate(conversation_id, position) {
                log::warn!("Failed to truncate persisted conversation: {}", e);
            }
        }
        self.begin(conversation_id, &placeholder);
        Ok(placeholder)
    }

    /// Publishes the current state of the in-flight turn
    pub fn apply_turn_snapshot(
        &mut self,
        conversation_id: &str,
        turn: Turn,
        state: TurnState,
    ) -> Result<TurnSnapshot> {
        let in_flight = self
            .in_flight
            .get_mut(conversation_id)
            .ok_or_else(|| Error::not_found(format!("no turn in flight for {}", conversation_id)))?;
        if in_flight.turn_id != turn.id {
            return Err(Error::not_found(format!(
                "turn {} is not in flight for {}",
                turn.id, conversation_id
            )));
        }
        in_flight.state = state;

        let snapshot = Arc::new(turn);
        self.replace_turn(conversation_id, &snapshot)?;
        Ok(self.publish(conversation_id, snapshot, state))
    }

    /// Publishes a terminal turn, releases the in-flight slot, and persists the turn
    pub fn finish_turn(
        &mut self,
        conversation_id: &str,
        turn: Turn,
        state: TurnState,
    ) -> Result<TurnSnapshot> {
        if !state.is_terminal() {
            return Err(Error::invalid_input(format!(
                "cannot finish a turn in state {:?}",
                state
            )));
        }

        let snapshot = self.apply_turn_snapshot(conversation_id, turn, state)?;
        self.in_flight.remove(conversation_id);

        if state == TurnState::Finalized {
            self.auto_title(conversation_id);
        }
        self.persist(conversation_id, &snapshot.turn);
        log::debug!(
            "Turn {} of conversation {} ended as {:?}",
            snapshot.turn.id,
            conversation_id,
            state
        );
        Ok(snapshot)
    }

    /// Turns to send upstream for the conversation's next request, excluding the
    /// in-flight placeholder
    pub fn history_for_request(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let conversation = self
            .get(conversation_id)
            .ok_or_else(|| Error::not_found(format!("conversation {}", conversation_id)))?;
        let pending = self.in_flight.get(conversation_id).map(|f| f.turn_id.as_str());
        Ok(conversation
            .messages
            .iter()
            .filter(|t| Some(t.id.as_str()) != pending)
            .cloned()
            .collect())
    }

    fn ensure_idle(&self, conversation_id: &str) -> Result<()> {
        if self.in_flight.contains_key(conversation_id) {
            log::warn!("Rejected turn start: {} already in flight", conversation_id);
            return Err(Error::already_in_flight(conversation_id));
        }
        Ok(())
    }

    fn begin(&mut self, conversation_id: &str, placeholder: &Turn) {
        self.in_flight.insert(
            conversation_id.to_string(),
            InFlight {
                turn_id: placeholder.id.clone(),
                state: TurnState::Empty,
            },
        );
        self.publish(
            conversation_id,
            Arc::new(placeholder.clone()),
            TurnState::Empty,
        );
    }

    fn get_mut(&mut self, conversation_id: &str) -> Result<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| Error::not_found(format!("conversation {}", conversation_id)))
    }

    fn replace_turn(&mut self, conversation_id: &str, turn: &Arc<Turn>) -> Result<()> {
        let conversation = self.get_mut(conversation_id)?;
        let slot = conversation
            .messages
            .iter_mut()
            .find(|t| t.id == turn.id)
            .ok_or_else(|| Error::not_found(format!("turn {}", turn.id)))?;
        *slot = Turn::clone(turn);
        Ok(())
    }

    fn publish(&mut self, conversation_id: &str, turn: Arc<Turn>, state: TurnState) -> TurnSnapshot {
        let snapshot = TurnSnapshot {
            conversation_id: conversation_id.to_string(),
            turn,
            state,
        };
        self.subscribers
            .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
        snapshot
    }

    fn auto_title(&mut self, conversation_id: &str) {
        let Ok(conversation) = self.get_mut(conversation_id) else {
            return;
        };
        if conversation.title != NEW_CHAT_TITLE {
            return;
        }
        let prompt = conversation
            .messages
            .iter()
            .find(|t| t.role == Role::User)
            .and_then(Turn::first_text)
            .map(title_from_prompt)
            .filter(|title| !title.is_empty());
        if let Some(title) = prompt {
            conversation.title = title;
        }
    }

    fn persist(&self, conversation_id: &str, turn: &Turn) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append_turn(conversation_id, turn) {
                log::warn!("Failed to persist turn {}: {}", turn.id, e);
            }
        }
    }

    fn sort_pinned_first(&mut self) {
        // Stable, so relative order within each group is kept
        self.conversations.sort_by_key(|c| !c.pinned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Part;
    use futures::StreamExt;

    fn store_with_conversation() -> (ConversationStore, String) {
        let mut store = ConversationStore::new();
        let id = store.create_conversation("gemini-2.0-flash");
        (store, id)
    }

    #[test]
    fn test_start_turn_appends_user_and_placeholder() {
        let (mut store, id) = store_with_conversation();
        let placeholder = store.start_turn(&id, Turn::user("hi")).unwrap();

        let conversation = store.get(&id).unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].id, placeholder.id);
        assert!(placeholder.parts.is_empty());
        assert_eq!(store.in_flight_state(&id), Some(TurnState::Empty));
    }

    #[test]
    fn test_second_start_is_rejected_without_touching_first() {
        let (mut store, id) = store_with_conversation();
        let mut placeholder = store.start_turn(&id, Turn::user("one")).unwrap();
        placeholder.parts.push(Part::text("partial"));
        store
            .apply_turn_snapshot(&id, placeholder.clone(), TurnState::Accumulating)
            .unwrap();

        let err = store.start_turn(&id, Turn::user("two")).unwrap_err();
        assert!(matches!(err, Error::AlreadyInFlight { .. }));

        let conversation = store.get(&id).unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1], placeholder);
        assert_eq!(store.in_flight_state(&id), Some(TurnState::Accumulating));
    }

    #[test]
    fn test_snapshot_for_unknown_turn_rejected() {
        let (mut store, id) = store_with_conversation();
        store.start_turn(&id, Turn::user("one")).unwrap();
        let stranger = Turn::model(vec![Part::text("x")]);
        assert!(store
            .apply_turn_snapshot(&id, stranger, TurnState::Accumulating)
            .is_err());
    }

    #[tokio::test]
    async fn test_snapshots_are_distinct_instances() {
        let (mut store, id) = store_with_conversation();
        let mut updates = store.subscribe();

        let mut turn = store.start_turn(&id, Turn::user("hi")).unwrap();
        turn.parts.push(Part::text("a"));
        store
            .apply_turn_snapshot(&id, turn.clone(), TurnState::Accumulating)
            .unwrap();
        store
            .apply_turn_snapshot(&id, turn.clone(), TurnState::Accumulating)
            .unwrap();

        let first = updates.next().await.unwrap();
        let second = updates.next().await.unwrap();
        let third = updates.next().await.unwrap();
        assert_eq!(first.state, TurnState::Empty);
        assert!(!Arc::ptr_eq(&second.turn, &third.turn));
        assert_eq!(*second.turn, *third.turn);
    }

    #[test]
    fn test_finish_turn_titles_and_persists() {
        let sink = Arc::new(MemorySink::new());
        let mut store = ConversationStore::with_sink(sink.clone());
        let id = store.create_conversation("gemini-2.0-flash");

        let mut turn = store
            .start_turn(&id, Turn::user("What is the capital of Norway and why?"))
            .unwrap();
        turn.parts.push(Part::text("Oslo"));
        store.finish_turn(&id, turn, TurnState::Finalized).unwrap();

        assert!(!store.is_in_flight(&id));
        assert_eq!(store.get(&id).unwrap().title, "What is the capital of Norway ...");
        assert_eq!(sink.turns(&id).len(), 2);
    }

    #[test]
    fn test_aborted_turn_keeps_title() {
        let (mut store, id) = store_with_conversation();
        let turn = store.start_turn(&id, Turn::user("hello")).unwrap();
        store.finish_turn(&id, turn, TurnState::Aborted).unwrap();
        assert_eq!(store.get(&id).unwrap().title, NEW_CHAT_TITLE);
    }

    #[test]
    fn test_finish_requires_terminal_state() {
        let (mut store, id) = store_with_conversation();
        let turn = store.start_turn(&id, Turn::user("hello")).unwrap();
        assert!(store
            .finish_turn(&id, turn, TurnState::Accumulating)
            .is_err());
        assert!(store.is_in_flight(&id));
    }

    #[test]
    fn test_regeneration_truncates() {
        let (mut store, id) = store_with_conversation();
        let mut first = store.start_turn(&id, Turn::user("one")).unwrap();
        first.parts.push(Part::text("answer one"));
        let first_id = first.id.clone();
        store.finish_turn(&id, first, TurnState::Finalized).unwrap();

        let second = store.start_turn(&id, Turn::user("two")).unwrap();
        store.finish_turn(&id, second, TurnState::Finalized).unwrap();
        assert_eq!(store.get(&id).unwrap().messages.len(), 4);

        let fresh = store.start_regeneration(&id, &first_id).unwrap();
        let conversation = store.get(&id).unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].id, fresh.id);
        assert_ne!(fresh.id, first_id);

        let history = store.history_for_request(&id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[test]
    fn test_regeneration_rejects_user_turn() {
        let (mut store, id) = store_with_conversation();
        let turn = store.start_turn(&id, Turn::user("one")).unwrap();
        store.finish_turn(&id, turn, TurnState::Finalized).unwrap();
        let user_id = store.get(&id).unwrap().messages[0].id.clone();
        assert!(matches!(
            store.start_regeneration(&id, &user_id),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_conversation_management() {
        let mut store = ConversationStore::new();
        let a = store.create_conversation("m");
        let b = store.create_conversation("m");
        assert_eq!(store.list()[0].id, b);

        assert!(store.toggle_pin(&a).unwrap());
        assert_eq!(store.list()[0].id, a);

        let c = store.create_conversation("m");
        assert_eq!(store.list()[1].id, c);

        store.rename(&b, "  Trip notes ").unwrap();
        assert_eq!(store.get(&b).unwrap().title, "Trip notes");
        assert!(store.rename(&b, "   ").is_err());

        store.delete(&c).unwrap();
        assert!(store.get(&c).is_none());
        assert!(matches!(store.delete(&c), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_refused_while_streaming() {
        let (mut store, id) = store_with_conversation();
        store.start_turn(&id, Turn::user("hi")).unwrap();
        assert!(matches!(
            store.delete(&id),
            Err(Error::AlreadyInFlight { .. })
        ));
    }
}
