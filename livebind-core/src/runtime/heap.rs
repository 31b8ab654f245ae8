//! 进程内托管堆
//!
//! 标记-清除回收：根为被 pin 的对象与静态字段。不可达且定义了
//! `finalize()V` 的对象在堆锁之外执行一次终结器，下一轮仍不可达时释放。
//! 终结器中的复活只在当轮有效，不支持二次终结。

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use super::class::{ManagedClass, CONSTRUCTOR};
use super::{
    classes, CollectionStats, GlobalRef, Invocation, ManagedRuntime, ManagedValue, MethodBody, NativeMethod,
    ObjectId, Throwable,
};
use crate::config::HeapSettings;
use crate::core::types::{ValueType, OBJECT_CLASS, STRING_CLASS};

/// 堆内存储的值：引用只记录标识，不持有 pin
#[derive(Debug, Clone, Copy, PartialEq)]
enum Stored {
    Void,
    Boolean(u8),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(Option<ObjectId>),
}

impl Stored {
    fn from_value(value: &ManagedValue) -> Self {
        match value {
            ManagedValue::Void => Stored::Void,
            ManagedValue::Boolean(v) => Stored::Boolean(*v),
            ManagedValue::Byte(v) => Stored::Byte(*v),
            ManagedValue::Char(v) => Stored::Char(*v),
            ManagedValue::Short(v) => Stored::Short(*v),
            ManagedValue::Int(v) => Stored::Int(*v),
            ManagedValue::Long(v) => Stored::Long(*v),
            ManagedValue::Float(v) => Stored::Float(*v),
            ManagedValue::Double(v) => Stored::Double(*v),
            ManagedValue::Ref(object) => Stored::Ref(object.as_ref().map(GlobalRef::id)),
        }
    }

    fn zero(ty: &ValueType) -> Self {
        match ty {
            ValueType::Void => Stored::Void,
            ValueType::Boolean => Stored::Boolean(0),
            ValueType::Byte => Stored::Byte(0),
            ValueType::Char => Stored::Char(0),
            ValueType::Short => Stored::Short(0),
            ValueType::Int => Stored::Int(0),
            ValueType::Long => Stored::Long(0),
            ValueType::Float => Stored::Float(0.0),
            ValueType::Double => Stored::Double(0.0),
            ValueType::Object(_) | ValueType::Array(_) => Stored::Ref(None),
        }
    }

    fn reference(&self) -> Option<ObjectId> {
        match self {
            Stored::Ref(id) => *id,
            _ => None,
        }
    }
}

enum ObjectBody {
    Instance(HashMap<String, Stored>),
    Str(String),
    Array { items: Vec<Stored> },
}

struct HeapObject {
    class: String,
    body: ObjectBody,
    pins: usize,
    handle_slot: u64,
    finalized: bool,
}

#[derive(Default)]
struct HeapState {
    objects: HashMap<ObjectId, HeapObject>,
    statics: HashMap<(String, String), Stored>,
    next_id: u64,
}

impl HeapState {
    /// 插入新对象，带一个归调用方所有的 pin
    fn insert(&mut self, class: &str, body: ObjectBody) -> ObjectId {
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.objects.insert(
            id,
            HeapObject {
                class: class.to_string(),
                body,
                pins: 1,
                handle_slot: 0,
                finalized: false,
            },
        );
        id
    }

    /// 把存储值转为托管值；引用在锁内 pin，所有权交给返回的 `GlobalRef`
    fn load(&mut self, stored: Stored, runtime: &Arc<dyn ManagedRuntime>) -> ManagedValue {
        match stored {
            Stored::Void => ManagedValue::Void,
            Stored::Boolean(v) => ManagedValue::Boolean(v),
            Stored::Byte(v) => ManagedValue::Byte(v),
            Stored::Char(v) => ManagedValue::Char(v),
            Stored::Short(v) => ManagedValue::Short(v),
            Stored::Int(v) => ManagedValue::Int(v),
            Stored::Long(v) => ManagedValue::Long(v),
            Stored::Float(v) => ManagedValue::Float(v),
            Stored::Double(v) => ManagedValue::Double(v),
            Stored::Ref(None) => ManagedValue::Ref(None),
            Stored::Ref(Some(id)) => match self.objects.get_mut(&id) {
                Some(object) => {
                    object.pins += 1;
                    ManagedValue::Ref(Some(GlobalRef::from_pinned(id, Arc::clone(runtime))))
                }
                None => ManagedValue::Ref(None),
            },
        }
    }

    fn mark(&self) -> HashSet<ObjectId> {
        let mut reachable = HashSet::new();
        let mut stack: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, object)| object.pins > 0)
            .map(|(id, _)| *id)
            .collect();
        stack.extend(self.statics.values().filter_map(Stored::reference));

        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(object) = self.objects.get(&id) {
                match &object.body {
                    ObjectBody::Instance(fields) => {
                        stack.extend(fields.values().filter_map(Stored::reference))
                    }
                    ObjectBody::Array { items } => stack.extend(items.iter().filter_map(Stored::reference)),
                    ObjectBody::Str(_) => {}
                }
            }
        }
        reachable
    }
}

/// 堆统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeapStats {
    /// 当前对象数
    pub live_objects: usize,
    /// 当前被 pin 的对象数
    pub pinned_objects: usize,
    /// 回收次数
    pub collections: u64,
    /// 累计释放对象数
    pub freed_total: u64,
    /// 累计终结对象数
    pub finalized_total: u64,
}

/// 托管堆
pub struct Heap {
    me: Weak<Heap>,
    classes: RwLock<HashMap<String, Arc<ManagedClass>>>,
    natives: RwLock<HashMap<(String, String, String), NativeMethod>>,
    state: Mutex<HeapState>,
    stats: Mutex<HeapStats>,
    settings: HeapSettings,
}

impl Heap {
    /// 创建新的托管堆
    pub fn new() -> Arc<Self> {
        Self::with_settings(HeapSettings::default())
    }

    pub fn with_settings(settings: HeapSettings) -> Arc<Self> {
        let heap = Arc::new_cyclic(|me| Heap {
            me: me.clone(),
            classes: RwLock::new(HashMap::new()),
            natives: RwLock::new(HashMap::new()),
            state: Mutex::new(HeapState::default()),
            stats: Mutex::new(HeapStats::default()),
            settings,
        });
        heap.install_builtins();
        heap
    }

    /// 以 `Arc<dyn ManagedRuntime>` 形式共享本堆
    pub fn runtime(&self) -> Result<Arc<dyn ManagedRuntime>, Throwable> {
        self.me
            .upgrade()
            .map(|heap| heap as Arc<dyn ManagedRuntime>)
            .ok_or_else(|| Throwable::illegal_state("managed heap is shutting down"))
    }

    /// 强引用本堆，供需要跨线程持有堆的托管代码使用
    pub fn shared(&self) -> Option<Arc<Heap>> {
        self.me.upgrade()
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    /// 定义类；父类必须已经存在
    pub fn define_class(&self, class: ManagedClass) -> Result<(), Throwable> {
        if let Some(parent) = &class.superclass {
            if self.find_class(parent).is_none() {
                return Err(Throwable::new(
                    classes::LINKAGE_ERROR,
                    format!("superclass {} of {} is not defined", parent, class.name),
                ));
            }
        }
        let mut table = self.classes.write();
        if table.contains_key(&class.name) {
            return Err(Throwable::new(
                classes::LINKAGE_ERROR,
                format!("class {} is already defined", class.name),
            ));
        }
        tracing::debug!(
            "Defined managed class {} ({} methods, {} fields)",
            class.name,
            class.methods.len(),
            class.fields.len()
        );
        table.insert(class.name.clone(), Arc::new(class));
        Ok(())
    }

    /// 虚调用
    pub fn call_virtual(
        &self,
        object: &GlobalRef,
        name: &str,
        descriptor: &str,
        args: &[ManagedValue],
    ) -> Result<ManagedValue, Throwable> {
        let class = self
            .class_of(object.id())
            .ok_or_else(|| Throwable::null_pointer("receiver is no longer alive"))?;
        self.invoke(&class, name, descriptor, Invocation::Virtual(object), args)
    }

    /// 精确调用 `class` 中解析到的实现
    pub fn call_exact(
        &self,
        class: &str,
        object: &GlobalRef,
        name: &str,
        descriptor: &str,
        args: &[ManagedValue],
    ) -> Result<ManagedValue, Throwable> {
        self.invoke(class, name, descriptor, Invocation::Exact(object), args)
    }

    pub fn call_static(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
        args: &[ManagedValue],
    ) -> Result<ManagedValue, Throwable> {
        self.invoke(class, name, descriptor, Invocation::Static, args)
    }

    /// 分配并调用构造器
    pub fn new_object(&self, class: &str, descriptor: &str, args: &[ManagedValue]) -> Result<GlobalRef, Throwable> {
        let object = self.allocate(class)?;
        self.invoke(class, CONSTRUCTOR, descriptor, Invocation::Exact(&object), args)?;
        Ok(object)
    }

    /// 读取实例字段
    pub fn field(&self, object: &GlobalRef, name: &str) -> Result<ManagedValue, Throwable> {
        let class = self
            .class_of(object.id())
            .ok_or_else(|| Throwable::null_pointer("receiver is no longer alive"))?;
        self.get_field(&class, name, Some(object))
    }

    /// 写入实例字段
    pub fn set_field_value(&self, object: &GlobalRef, name: &str, value: ManagedValue) -> Result<(), Throwable> {
        let class = self
            .class_of(object.id())
            .ok_or_else(|| Throwable::null_pointer("receiver is no longer alive"))?;
        self.set_field(&class, name, Some(object), value)
    }

    pub fn static_field(&self, class: &str, name: &str) -> Result<ManagedValue, Throwable> {
        self.get_field(class, name, None)
    }

    pub fn set_static_field(&self, class: &str, name: &str, value: ManagedValue) -> Result<(), Throwable> {
        self.set_field(class, name, None, value)
    }

    /// 把字符串值读出来；非字符串或 null 返回 `None`
    pub fn string_of(&self, value: &ManagedValue) -> Option<String> {
        value.as_object().and_then(|object| self.string_value(object))
    }

    /// 重复回收直到没有新的释放或终结，最多 `max_finalizer_passes` 轮
    pub fn collect_fully(&self) -> CollectionStats {
        let mut total = CollectionStats::default();
        for _ in 0..self.settings.max_finalizer_passes.max(1) {
            let pass = self.collect();
            total.scanned = pass.scanned;
            total.freed += pass.freed;
            total.finalized += pass.finalized;
            if pass.is_empty() {
                break;
            }
        }
        total
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// 对象是否仍在堆中
    pub fn contains(&self, object: ObjectId) -> bool {
        self.state.lock().objects.contains_key(&object)
    }

    pub fn stats(&self) -> HeapStats {
        let (live, pinned) = {
            let state = self.state.lock();
            let pinned = state.objects.values().filter(|o| o.pins > 0).count();
            (state.objects.len(), pinned)
        };
        let mut stats = self.stats.lock().clone();
        stats.live_objects = live;
        stats.pinned_objects = pinned;
        stats
    }

    fn install_builtins(&self) {
        let builtins: [(&str, Option<&str>); 16] = [
            (OBJECT_CLASS, None),
            (STRING_CLASS, Some(OBJECT_CLASS)),
            (classes::THROWABLE, Some(OBJECT_CLASS)),
            (classes::EXCEPTION, Some(classes::THROWABLE)),
            (classes::RUNTIME_EXCEPTION, Some(classes::EXCEPTION)),
            (classes::ILLEGAL_STATE, Some(classes::RUNTIME_EXCEPTION)),
            (classes::ILLEGAL_ARGUMENT, Some(classes::RUNTIME_EXCEPTION)),
            (classes::CLASS_CAST, Some(classes::RUNTIME_EXCEPTION)),
            (classes::NULL_POINTER, Some(classes::RUNTIME_EXCEPTION)),
            (classes::INSTANTIATION, Some(classes::EXCEPTION)),
            (classes::ERROR, Some(classes::THROWABLE)),
            (classes::LINKAGE_ERROR, Some(classes::ERROR)),
            (classes::UNSATISFIED_LINK, Some(classes::LINKAGE_ERROR)),
            (classes::NO_SUCH_METHOD, Some(classes::LINKAGE_ERROR)),
            (classes::NO_SUCH_FIELD, Some(classes::LINKAGE_ERROR)),
            (classes::ABSTRACT_METHOD, Some(classes::LINKAGE_ERROR)),
        ];
        let mut table = self.classes.write();
        for (name, superclass) in builtins {
            table.insert(
                name.to_string(),
                Arc::new(ManagedClass {
                    name: name.to_string(),
                    superclass: superclass.map(str::to_string),
                    methods: Vec::new(),
                    fields: Vec::new(),
                }),
            );
        }
    }

    /// 从实际类向上选择第一个可覆写的同签名实现
    fn select_override(&self, actual: &str, name: &str, descriptor: &str) -> Option<(Arc<ManagedClass>, usize)> {
        let mut current = self.find_class(actual);
        while let Some(candidate) = current {
            if let Some(index) = candidate.method_index(name, descriptor) {
                if candidate.methods[index].is_virtual() {
                    return Some((candidate, index));
                }
            }
            current = candidate
                .superclass
                .as_deref()
                .and_then(|parent| self.find_class(parent));
        }
        None
    }

    fn execute(
        &self,
        class: &Arc<ManagedClass>,
        index: usize,
        this: Option<&GlobalRef>,
        args: &[ManagedValue],
    ) -> Result<ManagedValue, Throwable> {
        let method = &class.methods[index];
        match &method.body {
            MethodBody::Managed(body) => {
                let call = ManagedCall {
                    heap: self,
                    class: &class.name,
                    this,
                    args,
                };
                body(&call)
            }
            MethodBody::Native => {
                let key = (class.name.clone(), method.name.clone(), method.descriptor.clone());
                let entry = self.natives.read().get(&key).cloned();
                match entry {
                    Some(entry) => entry(this, args),
                    None => Err(Throwable::new(
                        classes::UNSATISFIED_LINK,
                        format!("{}.{}{}", class.name, method.name, method.descriptor),
                    )),
                }
            }
            MethodBody::Abstract => Err(Throwable::new(
                classes::ABSTRACT_METHOD,
                format!("{}.{}{}", class.name, method.name, method.descriptor),
            )),
        }
    }

    fn finalizable_classes(&self) -> HashSet<String> {
        let names: Vec<String> = self.classes.read().keys().cloned().collect();
        names
            .into_iter()
            .filter(|name| self.resolve_method(name, "finalize", "()V").is_some())
            .collect()
    }

    fn check_reference(&self, value: &ManagedValue, ty: &ValueType) -> Result<(), Throwable> {
        if !value.matches(ty) {
            return Err(Throwable::illegal_argument(format!(
                "expected {} but got {}",
                ty,
                value.kind_name()
            )));
        }
        if let Some(object) = value.as_object() {
            let target = match ty {
                ValueType::Object(class) => class.clone(),
                other => other.descriptor(),
            };
            if !self.is_instance_of(object, &target) {
                return Err(Throwable::new(classes::CLASS_CAST, target));
            }
        }
        Ok(())
    }
}

impl ManagedRuntime for Heap {
    fn find_class(&self, name: &str) -> Option<Arc<ManagedClass>> {
        self.classes.read().get(name).cloned()
    }

    fn is_assignable(&self, class: &str, target: &str) -> bool {
        if class == target || target == OBJECT_CLASS {
            return true;
        }
        if let (Some(element), Some(target_element)) = (class.strip_prefix('['), target.strip_prefix('[')) {
            return match (ValueType::parse(element), ValueType::parse(target_element)) {
                (Ok(ValueType::Object(a)), Ok(ValueType::Object(b))) => self.is_assignable(&a, &b),
                _ => false,
            };
        }
        let mut current = self.superclass_of(class);
        while let Some(parent) = current {
            if parent == target {
                return true;
            }
            current = self.superclass_of(&parent);
        }
        false
    }

    fn class_of(&self, object: ObjectId) -> Option<String> {
        self.state.lock().objects.get(&object).map(|o| o.class.clone())
    }

    fn allocate(&self, class: &str) -> Result<GlobalRef, Throwable> {
        if self.find_class(class).is_none() {
            return Err(Throwable::new(
                classes::LINKAGE_ERROR,
                format!("class {} is not defined", class),
            ));
        }
        let mut fields = HashMap::new();
        let mut current = self.find_class(class);
        while let Some(candidate) = current {
            for field in candidate.fields.iter().filter(|f| !f.is_static) {
                fields
                    .entry(field.name.clone())
                    .or_insert_with(|| Stored::zero(&field.ty));
            }
            current = candidate
                .superclass
                .as_deref()
                .and_then(|parent| self.find_class(parent));
        }
        let runtime = self.runtime()?;
        let id = self.state.lock().insert(class, ObjectBody::Instance(fields));
        Ok(GlobalRef::from_pinned(id, runtime))
    }

    fn invoke(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
        invocation: Invocation<'_>,
        args: &[ManagedValue],
    ) -> Result<ManagedValue, Throwable> {
        let (declaring, index) = self.resolve_method(class, name, descriptor).ok_or_else(|| {
            Throwable::new(classes::NO_SUCH_METHOD, format!("{}.{}{}", class, name, descriptor))
        })?;
        let method = &declaring.methods[index];

        match (&invocation, method.is_static) {
            (Invocation::Static, false) => {
                return Err(Throwable::new(
                    classes::LINKAGE_ERROR,
                    format!("{}.{}{} is an instance method", declaring.name, name, descriptor),
                ))
            }
            (Invocation::Virtual(_) | Invocation::Exact(_), true) => {
                return Err(Throwable::new(
                    classes::LINKAGE_ERROR,
                    format!("{}.{}{} is a static method", declaring.name, name, descriptor),
                ))
            }
            _ => {}
        }

        if args.len() != method.signature.arity() {
            return Err(Throwable::illegal_argument(format!(
                "{}.{}{} expects {} arguments, got {}",
                declaring.name,
                name,
                descriptor,
                method.signature.arity(),
                args.len()
            )));
        }
        for (arg, ty) in args.iter().zip(&method.signature.params) {
            self.check_reference(arg, ty)?;
        }

        let (target_class, target_index) = match invocation {
            Invocation::Virtual(receiver) | Invocation::Exact(receiver) => {
                let actual = self
                    .class_of(receiver.id())
                    .ok_or_else(|| Throwable::null_pointer("receiver is no longer alive"))?;
                if !self.is_assignable(&actual, class) {
                    return Err(Throwable::new(classes::CLASS_CAST, class.to_string()));
                }
                match invocation {
                    Invocation::Virtual(_) if method.is_virtual() => self
                        .select_override(&actual, name, descriptor)
                        .unwrap_or((Arc::clone(&declaring), index)),
                    _ => (Arc::clone(&declaring), index),
                }
            }
            Invocation::Static => (Arc::clone(&declaring), index),
        };

        self.execute(&target_class, target_index, invocation.receiver(), args)
    }

    fn get_field(&self, class: &str, name: &str, target: Option<&GlobalRef>) -> Result<ManagedValue, Throwable> {
        let (declaring, index) = self
            .resolve_field(class, name)
            .ok_or_else(|| Throwable::new(classes::NO_SUCH_FIELD, format!("{}.{}", class, name)))?;
        let field = &declaring.fields[index];
        let runtime = self.runtime()?;

        let mut state = self.state.lock();
        let stored = if field.is_static {
            state
                .statics
                .get(&(declaring.name.clone(), field.name.clone()))
                .copied()
                .unwrap_or_else(|| Stored::zero(&field.ty))
        } else {
            let target = target.ok_or_else(|| {
                Throwable::null_pointer(format!("instance field {}.{} read without receiver", class, name))
            })?;
            let object = state
                .objects
                .get(&target.id())
                .ok_or_else(|| Throwable::null_pointer("receiver is no longer alive"))?;
            match &object.body {
                ObjectBody::Instance(fields) => fields.get(name).copied().ok_or_else(|| {
                    Throwable::new(classes::NO_SUCH_FIELD, format!("{}.{}", object.class, name))
                })?,
                _ => {
                    return Err(Throwable::new(
                        classes::NO_SUCH_FIELD,
                        format!("{}.{}", object.class, name),
                    ))
                }
            }
        };
        Ok(state.load(stored, &runtime))
    }

    fn set_field(
        &self,
        class: &str,
        name: &str,
        target: Option<&GlobalRef>,
        value: ManagedValue,
    ) -> Result<(), Throwable> {
        let (declaring, index) = self
            .resolve_field(class, name)
            .ok_or_else(|| Throwable::new(classes::NO_SUCH_FIELD, format!("{}.{}", class, name)))?;
        let field = &declaring.fields[index];
        self.check_reference(&value, &field.ty)?;
        let stored = Stored::from_value(&value);

        let mut state = self.state.lock();
        if field.is_static {
            state
                .statics
                .insert((declaring.name.clone(), field.name.clone()), stored);
            return Ok(());
        }
        let target = target.ok_or_else(|| {
            Throwable::null_pointer(format!("instance field {}.{} written without receiver", class, name))
        })?;
        let object = state
            .objects
            .get_mut(&target.id())
            .ok_or_else(|| Throwable::null_pointer("receiver is no longer alive"))?;
        match &mut object.body {
            ObjectBody::Instance(fields) if fields.contains_key(name) => {
                fields.insert(name.to_string(), stored);
                Ok(())
            }
            _ => Err(Throwable::new(
                classes::NO_SUCH_FIELD,
                format!("{}.{}", object.class, name),
            )),
        }
    }

    fn register_native(&self, class: &str, name: &str, descriptor: &str, entry: NativeMethod) -> Result<(), Throwable> {
        let declared = self
            .find_class(class)
            .and_then(|c| c.declared_method(name, descriptor).map(|m| m.is_native()))
            .ok_or_else(|| Throwable::new(classes::NO_SUCH_METHOD, format!("{}.{}{}", class, name, descriptor)))?;
        if !declared {
            return Err(Throwable::new(
                classes::LINKAGE_ERROR,
                format!("{}.{}{} is not declared native", class, name, descriptor),
            ));
        }
        let key = (class.to_string(), name.to_string(), descriptor.to_string());
        if self.natives.write().insert(key, entry).is_some() {
            tracing::debug!("Rebound native method {}.{}{}", class, name, descriptor);
        }
        Ok(())
    }

    fn new_string(&self, value: &str) -> Result<GlobalRef, Throwable> {
        let runtime = self.runtime()?;
        let id = self
            .state
            .lock()
            .insert(STRING_CLASS, ObjectBody::Str(value.to_string()));
        Ok(GlobalRef::from_pinned(id, runtime))
    }

    fn string_value(&self, object: &GlobalRef) -> Option<String> {
        let state = self.state.lock();
        match &state.objects.get(&object.id())?.body {
            ObjectBody::Str(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn new_array(&self, element: &ValueType, items: Vec<ManagedValue>) -> Result<GlobalRef, Throwable> {
        if matches!(element, ValueType::Void | ValueType::Array(_)) {
            return Err(Throwable::illegal_argument(format!(
                "unsupported array element type {}",
                element
            )));
        }
        for item in &items {
            self.check_reference(item, element)?;
        }
        let stored: Vec<Stored> = items.iter().map(Stored::from_value).collect();
        let class = ValueType::array_of(element.clone()).descriptor();
        let runtime = self.runtime()?;
        let id = self
            .state
            .lock()
            .insert(&class, ObjectBody::Array { items: stored });
        Ok(GlobalRef::from_pinned(id, runtime))
    }

    fn array_items(&self, object: &GlobalRef) -> Option<Vec<ManagedValue>> {
        let runtime = self.runtime().ok()?;
        let mut state = self.state.lock();
        let stored = match &state.objects.get(&object.id())?.body {
            ObjectBody::Array { items } => items.clone(),
            _ => return None,
        };
        Some(stored.into_iter().map(|item| state.load(item, &runtime)).collect())
    }

    fn write_array(&self, object: &GlobalRef, items: Vec<ManagedValue>) -> Result<(), Throwable> {
        let class = self
            .class_of(object.id())
            .ok_or_else(|| Throwable::null_pointer("array is no longer alive"))?;
        let element = class
            .strip_prefix('[')
            .and_then(|e| ValueType::parse(e).ok())
            .ok_or_else(|| Throwable::illegal_argument(format!("{} is not an array", class)))?;
        for item in &items {
            self.check_reference(item, &element)?;
        }
        let stored: Vec<Stored> = items.iter().map(Stored::from_value).collect();

        let mut state = self.state.lock();
        match state.objects.get_mut(&object.id()).map(|o| &mut o.body) {
            Some(ObjectBody::Array { items: existing }) => {
                if existing.len() != stored.len() {
                    return Err(Throwable::illegal_argument(format!(
                        "array length mismatch: expected {}, got {}",
                        existing.len(),
                        stored.len()
                    )));
                }
                *existing = stored;
                Ok(())
            }
            _ => Err(Throwable::illegal_argument(format!("{} is not an array", class))),
        }
    }

    fn handle_slot(&self, object: ObjectId) -> u64 {
        self.state
            .lock()
            .objects
            .get(&object)
            .map(|o| o.handle_slot)
            .unwrap_or(0)
    }

    fn set_handle_slot(&self, object: ObjectId, raw: u64) {
        if let Some(o) = self.state.lock().objects.get_mut(&object) {
            o.handle_slot = raw;
        }
    }

    fn pin(&self, object: ObjectId) {
        if let Some(o) = self.state.lock().objects.get_mut(&object) {
            o.pins += 1;
        }
    }

    fn unpin(&self, object: ObjectId) {
        if let Some(o) = self.state.lock().objects.get_mut(&object) {
            o.pins = o.pins.saturating_sub(1);
        }
    }

    fn collect(&self) -> CollectionStats {
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(_) => return CollectionStats::default(),
        };
        let finalizable = self.finalizable_classes();
        let mut stats = CollectionStats::default();

        let pending: Vec<GlobalRef> = {
            let mut state = self.state.lock();
            stats.scanned = state.objects.len();

            let reachable = state.mark();
            let mut pending_ids = Vec::new();
            for (id, object) in state.objects.iter_mut() {
                if !reachable.contains(id) && !object.finalized && finalizable.contains(&object.class) {
                    // 终结期间保持存活
                    object.finalized = true;
                    object.pins += 1;
                    pending_ids.push(*id);
                }
            }

            // 待终结对象可达的对象本轮保留
            let retained = state.mark();
            let before = state.objects.len();
            state.objects.retain(|id, _| retained.contains(id));
            stats.freed = before - state.objects.len();

            pending_ids
                .into_iter()
                .map(|id| GlobalRef::from_pinned(id, Arc::clone(&runtime)))
                .collect()
        };

        for object in &pending {
            if let Err(thrown) = self.call_virtual(object, "finalize", "()V", &[]) {
                tracing::warn!("Finalizer for object {} threw {}", object.id(), thrown);
            }
            stats.finalized += 1;
        }
        drop(pending);

        {
            let mut totals = self.stats.lock();
            totals.collections += 1;
            totals.freed_total += stats.freed as u64;
            totals.finalized_total += stats.finalized as u64;
        }
        tracing::debug!(
            "Collection finished: scanned={}, freed={}, finalized={}",
            stats.scanned,
            stats.freed,
            stats.finalized
        );
        stats
    }
}

/// 托管方法执行帧
pub struct ManagedCall<'a> {
    heap: &'a Heap,
    class: &'a str,
    this: Option<&'a GlobalRef>,
    args: &'a [ManagedValue],
}

impl<'a> ManagedCall<'a> {
    pub fn heap(&self) -> &'a Heap {
        self.heap
    }

    /// 正在执行的方法的声明类
    pub fn class_name(&self) -> &'a str {
        self.class
    }

    pub fn this(&self) -> Result<&'a GlobalRef, Throwable> {
        self.this
            .ok_or_else(|| Throwable::null_pointer(format!("{}: no receiver in static context", self.class)))
    }

    pub fn args(&self) -> &'a [ManagedValue] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Result<&'a ManagedValue, Throwable> {
        self.args
            .get(index)
            .ok_or_else(|| Throwable::illegal_argument(format!("missing argument {}", index)))
    }

    pub fn bool_arg(&self, index: usize) -> Result<bool, Throwable> {
        self.arg(index)?
            .as_bool()
            .ok_or_else(|| Throwable::illegal_argument(format!("argument {} is not a boolean", index)))
    }

    pub fn int_arg(&self, index: usize) -> Result<i32, Throwable> {
        self.arg(index)?
            .as_int()
            .ok_or_else(|| Throwable::illegal_argument(format!("argument {} is not an int", index)))
    }

    pub fn long_arg(&self, index: usize) -> Result<i64, Throwable> {
        self.arg(index)?
            .as_long()
            .ok_or_else(|| Throwable::illegal_argument(format!("argument {} is not a long", index)))
    }

    pub fn object_arg(&self, index: usize) -> Result<Option<&'a GlobalRef>, Throwable> {
        match self.arg(index)? {
            ManagedValue::Ref(object) => Ok(object.as_ref()),
            other => Err(Throwable::illegal_argument(format!(
                "argument {} is a {}, not a reference",
                index,
                other.kind_name()
            ))),
        }
    }

    pub fn string_arg(&self, index: usize) -> Result<Option<String>, Throwable> {
        Ok(self.object_arg(index)?.and_then(|object| self.heap.string_value(object)))
    }

    /// 读取 `this` 的字段
    pub fn field(&self, name: &str) -> Result<ManagedValue, Throwable> {
        self.heap.field(self.this()?, name)
    }

    pub fn set_field(&self, name: &str, value: ManagedValue) -> Result<(), Throwable> {
        self.heap.set_field_value(self.this()?, name, value)
    }

    pub fn static_field(&self, name: &str) -> Result<ManagedValue, Throwable> {
        self.heap.static_field(self.class, name)
    }

    pub fn set_static_field(&self, name: &str, value: ManagedValue) -> Result<(), Throwable> {
        self.heap.set_static_field(self.class, name, value)
    }

    /// 在 `this` 上虚调用
    pub fn call_this(&self, name: &str, descriptor: &str, args: &[ManagedValue]) -> Result<ManagedValue, Throwable> {
        self.heap.call_virtual(self.this()?, name, descriptor, args)
    }

    /// 精确调用声明类父类中的实现
    pub fn call_super(&self, name: &str, descriptor: &str, args: &[ManagedValue]) -> Result<ManagedValue, Throwable> {
        let parent = self.heap.superclass_of(self.class).ok_or_else(|| {
            Throwable::new(classes::NO_SUCH_METHOD, format!("{} has no superclass", self.class))
        })?;
        self.heap.call_exact(&parent, self.this()?, name, descriptor, args)
    }

    pub fn new_string(&self, value: &str) -> Result<ManagedValue, Throwable> {
        Ok(ManagedValue::Ref(Some(self.heap.new_string(value)?)))
    }
}
