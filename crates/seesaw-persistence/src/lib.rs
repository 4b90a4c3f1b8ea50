//! Persistence for machines that exist across time.
//!
//! A [`PersistentMachine`] is a `Machine` that survives process restarts,
//! deploys, and node failures. Its state is durable.
//!
//! # The Contract
//!
//! 1. **Load before decide.** For every event routed to a persistent machine,
//!    the engine loads the current snapshot (or creates a new instance).
//! 2. **Decide is unchanged.** `decide(&mut self, event)` runs exactly as it
//!    does for in-memory machines. Persistence is invisible to decision logic.
//! 3. **Save before dispatch.** If state changed, the snapshot is persisted
//!    before any command is dispatched.
//! 4. **Skip save if unchanged.** If `changed()` returns false, no write
//!    occurs and the revision does not advance.
//!
//! This guarantees durable *intent*, not durable *execution*: once save
//! succeeds, the machine's decision is recorded, but command dispatch is
//! best-effort. For durable execution, dispatch through a `Background` or
//! `Scheduled` command onto a `JobStore`.

use std::hash::Hash;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use smallvec::SmallVec;

use seesaw_core::{Event, Machine};

/// Errors from machine state storage. `Conflict` and `Backend` are kept
/// distinct because they call for different responses: a conflict means
/// reprocess with fresh state, a backend error means the storage layer
/// itself failed.
#[derive(Debug)]
pub enum StoreError {
    /// Another writer modified the machine since it was loaded.
    Conflict,
    /// Storage backend failed (timeout, connection, serialization).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "revision conflict: state was modified concurrently"),
            StoreError::Backend(e) => write!(f, "storage backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Conflict => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

/// Optimistic concurrency token. A save must provide the revision it
/// expects to be overwriting; a mismatch means someone else got there first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    /// A machine that has never been saved.
    pub const NONE: Revision = Revision(0);

    pub fn new(value: u64) -> Self {
        Revision(value)
    }

    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// Extracts machine identity from events, fanning out to multiple instances
/// when an event targets more than one.
pub trait Router: Send + Sync + 'static {
    type Event: Event;
    type Id: Clone + Eq + Hash + Send + Sync + 'static;

    /// Empty if the event doesn't target any persistent machine.
    fn route(&self, event: &Self::Event) -> SmallVec<[Self::Id; 1]>;
}

/// Persists machine state with optimistic concurrency control.
#[async_trait]
pub trait MachineStore<Id, State>: Send + Sync + 'static
where
    Id: Clone + Eq + Hash + Send + Sync + 'static,
    State: Send + Sync,
{
    /// `None` if the machine has never been saved.
    async fn load(&self, id: &Id) -> Result<Option<(State, Revision)>, StoreError>;

    /// `expected` must match the stored revision or this fails with `Conflict`.
    async fn save(&self, id: &Id, state: &State, expected: Revision) -> Result<Revision, StoreError>;
}

/// A `Machine` that survives process restarts. State remains internal to
/// the machine; these hooks only serialize/deserialize it around `decide`.
pub trait PersistentMachine: Machine {
    type Snapshot: Serialize + DeserializeOwned + Send + Sync;
    type Id: Clone + Eq + Hash + Send + Sync + 'static;

    /// Called when `MachineStore::load` returns `None`. Should mark itself
    /// changed so the new instance gets persisted.
    fn create(id: &Self::Id, event: &Self::Event) -> Self;

    /// Reconstructs from a persisted snapshot. Should mark itself unchanged.
    fn restore(snapshot: Self::Snapshot) -> Self;

    fn snapshot(&self) -> Self::Snapshot;

    /// If false, the engine skips the save and the revision does not advance.
    fn changed(&self) -> bool;

    fn mark_clean(&mut self);
}

/// In-memory `MachineStore`, for tests and harnesses that don't need a
/// durable backend.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct InMemoryStore<Id, State> {
        data: Mutex<HashMap<Id, (State, Revision)>>,
    }

    impl<Id, State> InMemoryStore<Id, State> {
        pub fn new() -> Self {
            Self {
                data: Mutex::new(HashMap::new()),
            }
        }
    }

    impl<Id, State> Default for InMemoryStore<Id, State> {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl<Id, State> MachineStore<Id, State> for InMemoryStore<Id, State>
    where
        Id: Clone + Eq + Hash + Send + Sync + 'static,
        State: Clone + Send + Sync + 'static,
    {
        async fn load(&self, id: &Id) -> Result<Option<(State, Revision)>, StoreError> {
            let data = self
                .data
                .lock()
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {e}")))?;
            Ok(data.get(id).cloned())
        }

        async fn save(&self, id: &Id, state: &State, expected: Revision) -> Result<Revision, StoreError> {
            let mut data = self
                .data
                .lock()
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {e}")))?;

            let current_rev = data.get(id).map(|(_, r)| *r).unwrap_or(Revision::NONE);
            if current_rev != expected {
                return Err(StoreError::Conflict);
            }

            let new_rev = expected.next();
            data.insert(id.clone(), (state.clone(), new_rev));
            Ok(new_rev)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::InMemoryStore;
    use super::*;
    use seesaw_core::Command;
    use smallvec::smallvec;
    use uuid::Uuid;

    #[derive(Debug, Clone)]
    enum TestEvent {
        Started { id: Uuid },
        StepCompleted { id: Uuid, step: u32 },
    }
    impl Event for TestEvent {}

    #[derive(Debug, Clone)]
    enum TestCommand {
        DoStep { step: u32 },
        Complete,
    }
    impl Command for TestCommand {}

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
    struct TestSnapshot {
        id: Uuid,
        current_step: u32,
        completed: bool,
    }

    struct TestMachine {
        id: Uuid,
        current_step: u32,
        completed: bool,
        changed: bool,
    }

    impl Machine for TestMachine {
        type Event = TestEvent;
        type Command = TestCommand;

        fn decide(&mut self, event: &TestEvent) -> Option<TestCommand> {
            match event {
                TestEvent::Started { .. } => {
                    self.current_step = 1;
                    self.changed = true;
                    Some(TestCommand::DoStep { step: 1 })
                }
                TestEvent::StepCompleted { step, .. } => {
                    if *step < 3 {
                        self.current_step = step + 1;
                        self.changed = true;
                        Some(TestCommand::DoStep { step: step + 1 })
                    } else {
                        self.completed = true;
                        self.changed = true;
                        Some(TestCommand::Complete)
                    }
                }
            }
        }
    }

    impl PersistentMachine for TestMachine {
        type Snapshot = TestSnapshot;
        type Id = Uuid;

        fn create(id: &Uuid, _event: &TestEvent) -> Self {
            TestMachine {
                id: *id,
                current_step: 0,
                completed: false,
                changed: true,
            }
        }

        fn restore(snapshot: TestSnapshot) -> Self {
            TestMachine {
                id: snapshot.id,
                current_step: snapshot.current_step,
                completed: snapshot.completed,
                changed: false,
            }
        }

        fn snapshot(&self) -> TestSnapshot {
            TestSnapshot {
                id: self.id,
                current_step: self.current_step,
                completed: self.completed,
            }
        }

        fn changed(&self) -> bool {
            self.changed
        }

        fn mark_clean(&mut self) {
            self.changed = false;
        }
    }

    struct TestRouter;

    impl Router for TestRouter {
        type Event = TestEvent;
        type Id = Uuid;

        fn route(&self, event: &TestEvent) -> SmallVec<[Uuid; 1]> {
            match event {
                TestEvent::Started { id } => smallvec![*id],
                TestEvent::StepCompleted { id, .. } => smallvec![*id],
            }
        }
    }

    #[test]
    fn revision_none() {
        assert!(Revision::NONE.is_none());
        assert_eq!(Revision::NONE.value(), 0);
    }

    #[test]
    fn revision_next() {
        let r1 = Revision::NONE;
        let r2 = r1.next();
        let r3 = r2.next();
        assert_eq!(r1.value(), 0);
        assert_eq!(r2.value(), 1);
        assert_eq!(r3.value(), 2);
    }

    #[test]
    fn revision_display() {
        assert_eq!(format!("{}", Revision::NONE), "NONE");
        assert_eq!(format!("{}", Revision::new(5)), "r5");
    }

    #[test]
    fn store_error_display() {
        let conflict = StoreError::Conflict;
        assert!(conflict.to_string().contains("conflict"));

        let backend = StoreError::Backend(anyhow::anyhow!("connection failed"));
        assert!(backend.to_string().contains("connection failed"));
    }

    #[test]
    fn router_routes_events() {
        let router = TestRouter;
        let id = Uuid::new_v4();
        let ids = router.route(&TestEvent::Started { id });
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0], id);
    }

    #[test]
    fn persistent_machine_create() {
        let id = Uuid::new_v4();
        let event = TestEvent::Started { id };
        let machine = TestMachine::create(&id, &event);
        assert_eq!(machine.id, id);
        assert_eq!(machine.current_step, 0);
        assert!(!machine.completed);
        assert!(machine.changed);
    }

    #[test]
    fn persistent_machine_restore() {
        let snapshot = TestSnapshot {
            id: Uuid::new_v4(),
            current_step: 2,
            completed: false,
        };
        let machine = TestMachine::restore(snapshot.clone());
        assert_eq!(machine.id, snapshot.id);
        assert_eq!(machine.current_step, 2);
        assert!(!machine.changed);
    }

    #[test]
    fn persistent_machine_changed_tracking() {
        let id = Uuid::new_v4();
        let event = TestEvent::Started { id };
        let mut machine = TestMachine::create(&id, &event);
        assert!(machine.changed());

        machine.mark_clean();
        assert!(!machine.changed());

        machine.decide(&event);
        assert!(machine.changed());
    }

    #[tokio::test]
    async fn in_memory_store_load_empty() {
        let store: InMemoryStore<Uuid, TestSnapshot> = InMemoryStore::new();
        let id = Uuid::new_v4();
        let result = store.load(&id).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn in_memory_store_save_and_load() {
        let store: InMemoryStore<Uuid, TestSnapshot> = InMemoryStore::new();
        let id = Uuid::new_v4();
        let snapshot = TestSnapshot {
            id,
            current_step: 1,
            completed: false,
        };

        let rev = store.save(&id, &snapshot, Revision::NONE).await.unwrap();
        assert_eq!(rev, Revision::new(1));

        let (loaded, loaded_rev) = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded_rev, Revision::new(1));
    }

    #[tokio::test]
    async fn in_memory_store_conflict_detection() {
        let store: InMemoryStore<Uuid, TestSnapshot> = InMemoryStore::new();
        let id = Uuid::new_v4();
        let snapshot = TestSnapshot {
            id,
            current_step: 1,
            completed: false,
        };

        store.save(&id, &snapshot, Revision::NONE).await.unwrap();

        let result = store.save(&id, &snapshot, Revision::NONE).await;
        assert!(matches!(result, Err(StoreError::Conflict)));

        let result = store.save(&id, &snapshot, Revision::new(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn full_persistent_machine_flow() {
        let store: InMemoryStore<Uuid, TestSnapshot> = InMemoryStore::new();
        let router = TestRouter;
        let id = Uuid::new_v4();

        let event1 = TestEvent::Started { id };
        let ids = router.route(&event1);
        assert_eq!(ids.len(), 1);

        let loaded = store.load(&id).await.unwrap();
        assert!(loaded.is_none());

        let mut machine = TestMachine::create(&id, &event1);
        let cmd = machine.decide(&event1);
        assert!(matches!(cmd, Some(TestCommand::DoStep { step: 1 })));
        assert!(machine.changed());

        let snapshot = machine.snapshot();
        let rev = store.save(&id, &snapshot, Revision::NONE).await.unwrap();
        machine.mark_clean();

        let event2 = TestEvent::StepCompleted { id, step: 1 };
        let (loaded_snapshot, loaded_rev) = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded_rev, rev);

        let mut machine = TestMachine::restore(loaded_snapshot);
        assert!(!machine.changed());

        let cmd = machine.decide(&event2);
        assert!(matches!(cmd, Some(TestCommand::DoStep { step: 2 })));
        assert!(machine.changed());

        let snapshot = machine.snapshot();
        let rev = store.save(&id, &snapshot, loaded_rev).await.unwrap();
        assert_eq!(rev, Revision::new(2));
    }
}
