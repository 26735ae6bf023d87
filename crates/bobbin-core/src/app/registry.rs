//! JobBodyRegistry - TaskKind ごとの実行本体
//!
//! 起動時に登録（mutable）、実行時は読むだけ（immutable）なのでロック不要。

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::TaskKind;
use crate::ports::JobBody;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job body for kind '{0}' is already registered")]
    AlreadyRegistered(TaskKind),
}

#[derive(Default)]
pub struct JobBodyRegistry {
    bodies: HashMap<TaskKind, Arc<dyn JobBody>>,
}

impl JobBodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, body: Arc<dyn JobBody>) -> Result<(), RegistryError> {
        let kind = body.kind();
        if self.bodies.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.bodies.insert(kind, body);
        Ok(())
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn JobBody>> {
        self.bodies.get(&kind).cloned()
    }

    pub fn registered_kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.bodies.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}
