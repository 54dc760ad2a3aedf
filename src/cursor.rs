use crate::message::DeltaPath;

pub const MAIN_CONTAINER: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Container {
    path: DeltaPath,
    next_index: u32,
}

/// Allocates delta paths for a run. The bottom of the stack is the main
/// container; every open block pushes its own container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCursor {
    stack: Vec<Container>,
}

pub type CursorSnapshot = OutputCursor;

impl Default for OutputCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputCursor {
    pub fn new() -> Self {
        Self {
            stack: vec![Container {
                path: vec![MAIN_CONTAINER],
                next_index: 0,
            }],
        }
    }

    /// A cursor that writes into the block at `path`, starting at its first
    /// slot.
    pub fn inside(path: DeltaPath) -> Self {
        let mut cursor = Self::new();
        cursor.stack.push(Container {
            path,
            next_index: 0,
        });
        cursor
    }

    fn top(&mut self) -> &mut Container {
        if self.stack.is_empty() {
            *self = Self::new();
        }
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    pub fn peek_path(&self) -> DeltaPath {
        match self.stack.last() {
            Some(top) => {
                let mut path = top.path.clone();
                path.push(top.next_index);
                path
            }
            None => vec![MAIN_CONTAINER, 0],
        }
    }

    pub fn next_path(&mut self) -> DeltaPath {
        let top = self.top();
        let mut path = top.path.clone();
        path.push(top.next_index);
        top.next_index += 1;
        path
    }

    /// Allocates the slot for a new block and makes it the current container.
    pub fn open_block(&mut self) -> DeltaPath {
        let path = self.next_path();
        self.stack.push(Container {
            path: path.clone(),
            next_index: 0,
        });
        path
    }

    /// Returns `false` when only the main container is left.
    pub fn close_block(&mut self) -> bool {
        if self.stack.len() <= 1 {
            return false;
        }
        self.stack.pop();
        true
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: &CursorSnapshot) {
        *self = snapshot.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_container_nesting() {
        let mut cursor = OutputCursor::new();
        assert_eq!(cursor.next_path(), vec![0, 0]);
        assert_eq!(cursor.open_block(), vec![0, 1]);
        assert_eq!(cursor.next_path(), vec![0, 1, 0]);
        assert_eq!(cursor.next_path(), vec![0, 1, 1]);
        assert!(cursor.close_block());
        assert_eq!(cursor.next_path(), vec![0, 2]);
        assert!(!cursor.close_block());
    }

    #[test]
    fn restore_rewinds_to_snapshot() {
        let mut cursor = OutputCursor::new();
        cursor.next_path();
        let snapshot = cursor.snapshot();
        cursor.open_block();
        cursor.next_path();
        cursor.restore(&snapshot);
        assert_eq!(cursor.peek_path(), vec![0, 1]);
        assert_eq!(cursor.depth(), 1);
    }

    #[test]
    fn inside_writes_into_block() {
        let mut cursor = OutputCursor::inside(vec![0, 4]);
        assert_eq!(cursor.next_path(), vec![0, 4, 0]);
    }
}
