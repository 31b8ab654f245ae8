//! 托管对象引用
//!
//! `GlobalRef` 是一个根引用：存在期间对象不会被回收。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::{ManagedRuntime, ObjectId};

/// 已 pin 的托管对象引用
pub struct GlobalRef {
    id: ObjectId,
    runtime: Arc<dyn ManagedRuntime>,
}

impl GlobalRef {
    /// 接管一个调用方已经 pin 过的对象
    pub fn from_pinned(id: ObjectId, runtime: Arc<dyn ManagedRuntime>) -> Self {
        Self { id, runtime }
    }

    /// pin 对象并返回引用
    pub fn new(id: ObjectId, runtime: Arc<dyn ManagedRuntime>) -> Self {
        runtime.pin(id);
        Self { id, runtime }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn runtime(&self) -> &Arc<dyn ManagedRuntime> {
        &self.runtime
    }

    /// 对象的实际类名
    pub fn class_name(&self) -> Option<String> {
        self.runtime.class_of(self.id)
    }

    pub fn same_object(&self, other: &GlobalRef) -> bool {
        self.id == other.id
    }
}

impl Clone for GlobalRef {
    fn clone(&self) -> Self {
        Self::new(self.id, Arc::clone(&self.runtime))
    }
}

impl Drop for GlobalRef {
    fn drop(&mut self) {
        self.runtime.unpin(self.id);
    }
}

impl PartialEq for GlobalRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GlobalRef {}

impl Hash for GlobalRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalRef({})", self.id)
    }
}
