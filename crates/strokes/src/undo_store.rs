use std::sync::Arc;

use parking_lot::Mutex;
use scheduler_protocol::UndoCommand;

/// Undo history of low-resolution strokes.
///
/// Preview strokes are undone here when their full-resolution twin is
/// undone before the preview could be cancelled. The history is dropped as
/// soon as no full-resolution preview work is left in the queue.
#[derive(Default)]
pub struct LodNUndoStore {
    commands: Vec<Box<dyn UndoCommand>>,
    redo_commands: Vec<Box<dyn UndoCommand>>,
}

impl LodNUndoStore {
    pub fn add_command(&mut self, command: Box<dyn UndoCommand>) {
        self.redo_commands.clear();
        if let Some(last) = self.commands.last_mut()
            && last.id().is_some()
            && last.id() == command.id()
            && last.merge_with(command.as_ref())
        {
            return;
        }
        self.commands.push(command);
    }

    pub fn undo(&mut self) -> bool {
        let Some(mut command) = self.commands.pop() else {
            return false;
        };
        command.undo();
        self.redo_commands.push(command);
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(mut command) = self.redo_commands.pop() else {
            return false;
        };
        command.redo();
        self.commands.push(command);
        true
    }

    pub fn purge_redo_state(&mut self) {
        self.redo_commands.clear();
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.redo_commands.clear();
    }

    pub fn undo_len(&self) -> usize {
        self.commands.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_commands.len()
    }
}

/// Handle given to preview jobs so they can record what they did.
#[derive(Clone)]
pub struct LodNUndoAdapter {
    store: Arc<Mutex<LodNUndoStore>>,
}

impl LodNUndoAdapter {
    pub(crate) fn new(store: Arc<Mutex<LodNUndoStore>>) -> Self {
        Self { store }
    }

    pub fn add_command(&self, command: Box<dyn UndoCommand>) {
        self.store.lock().add_command(command);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;

    struct Delta {
        target: Arc<AtomicI32>,
        amount: i32,
        id: Option<u32>,
    }

    impl UndoCommand for Delta {
        fn undo(&mut self) {
            self.target.fetch_sub(self.amount, Ordering::SeqCst);
        }

        fn redo(&mut self) {
            self.target.fetch_add(self.amount, Ordering::SeqCst);
        }

        fn id(&self) -> Option<u32> {
            self.id
        }

        fn merge_with(&mut self, _other: &dyn UndoCommand) -> bool {
            self.amount += 1;
            true
        }
    }

    fn delta(target: &Arc<AtomicI32>, amount: i32, id: Option<u32>) -> Box<dyn UndoCommand> {
        target.fetch_add(amount, Ordering::SeqCst);
        Box::new(Delta {
            target: Arc::clone(target),
            amount,
            id,
        })
    }

    #[test]
    fn undo_and_redo_walk_history() {
        let value = Arc::new(AtomicI32::new(0));
        let mut store = LodNUndoStore::default();
        store.add_command(delta(&value, 5, None));
        store.add_command(delta(&value, 7, None));
        assert!(store.undo());
        assert_eq!(value.load(Ordering::SeqCst), 5);
        assert!(store.redo());
        assert_eq!(value.load(Ordering::SeqCst), 12);
        store.undo();
        store.purge_redo_state();
        assert!(!store.redo());
        assert_eq!(store.undo_len(), 1);
    }

    #[test]
    fn commands_with_matching_id_are_merged() {
        let value = Arc::new(AtomicI32::new(0));
        let mut store = LodNUndoStore::default();
        store.add_command(delta(&value, 1, Some(4)));
        store.add_command(delta(&value, 1, Some(4)));
        store.add_command(delta(&value, 1, Some(9)));
        assert_eq!(store.undo_len(), 2);
        store.clear();
        assert!(!store.undo());
    }
}
