//! In-process object broker
//!
//! Implements the same class/instance/method model as the WMI service:
//! declared properties with CIM types, spawnable class definitions, method
//! signatures with typed in/out parameters, and snapshot semantics (a fetched
//! handle never observes later changes; refetch by path to see them).
//! Method behavior is supplied by handler closures. Every remote round trip
//! is recorded so callers can assert on traffic.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::rc::Rc;

use super::{
    Connection, Connector, Credentials, PropertyBag, RawEnum, RawObject, CLASS_PROPERTY,
    PATH_PROPERTY,
};
use crate::variant::{CimBase, CimType, FromVariant, ObjectRef, Variant};
use crate::{Error, Result};

const PARAMETERS_CLASS: &str = "__PARAMETERS";

type Handler = Rc<dyn Fn(&MethodCall) -> Result<Vec<(String, Variant)>>>;

/// A class definition: declared properties and methods
#[derive(Clone)]
pub struct ClassDef {
    name: String,
    properties: Vec<(String, CimType)>,
    methods: Vec<MethodDef>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>, cim_type: CimType) -> Self {
        self.properties.push((name.into(), cim_type));
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// `CIM_ConcreteJob`-shaped job class
    pub fn concrete_job(name: impl Into<String>) -> Self {
        Self::new(name)
            .property("InstanceID", CimType::scalar(CimBase::String))
            .property("JobState", CimType::scalar(CimBase::UInt16))
            .property("ErrorCode", CimType::scalar(CimBase::UInt16))
            .property("ErrorDescription", CimType::scalar(CimBase::String))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn declared(&self, name: &str) -> Option<CimType> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
    }

    fn find_method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// A method signature and its behavior
#[derive(Clone)]
pub struct MethodDef {
    name: String,
    inputs: Vec<(String, CimType)>,
    outputs: Vec<(String, CimType)>,
    handler: Option<Handler>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            handler: None,
        }
    }

    pub fn input(mut self, name: impl Into<String>, cim_type: CimType) -> Self {
        self.inputs.push((name.into(), cim_type));
        self
    }

    pub fn output(mut self, name: impl Into<String>, cim_type: CimType) -> Self {
        self.outputs.push((name.into(), cim_type));
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&MethodCall) -> Result<Vec<(String, Variant)>> + 'static,
    {
        self.handler = Some(Rc::new(handler));
        self
    }

    fn parameter_class(params: &[(String, CimType)]) -> Option<Rc<ClassDef>> {
        if params.is_empty() {
            return None;
        }
        let class = params
            .iter()
            .fold(ClassDef::new(PARAMETERS_CLASS), |class, (name, t)| class.property(name.clone(), *t));
        Some(Rc::new(class))
    }
}

/// What a method handler sees
pub struct MethodCall {
    pub broker: MemoryBroker,
    pub target: String,
    pub method: String,
    pub inputs: PropertyBag,
}

impl MethodCall {
    pub fn input<T: FromVariant>(&self, name: &str) -> Result<T> {
        match self.inputs.get(name) {
            Some(value) => T::from_variant(value),
            None => T::from_variant(&Variant::Null),
        }
    }
}

/// One recorded round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(String),
    Query(String),
    EnumClass(String),
    GetObject(String),
    ExecMethod { path: String, method: String },
    Get(String),
    Put(String),
}

struct StoredObject {
    class: String,
    values: HashMap<String, Variant>,
    pending: VecDeque<(String, Variant)>,
}

#[derive(Default)]
struct BrokerState {
    classes: HashMap<String, Rc<ClassDef>>,
    objects: BTreeMap<String, StoredObject>,
    associations: Vec<(String, String)>,
    credentials: Option<Credentials>,
    next_id: u64,
    calls: Vec<Call>,
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Rc<RefCell<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials on connect
    pub fn require_credentials(&self, credentials: Credentials) {
        self.state.borrow_mut().credentials = Some(credentials);
    }

    pub fn define_class(&self, class: ClassDef) {
        let mut state = self.state.borrow_mut();
        state.classes.insert(class.name.clone(), Rc::new(class));
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.state.borrow().classes.contains_key(name)
    }

    /// Store a committed instance and return its path
    pub fn insert_instance<'a, I>(&self, class_name: &str, values: I) -> Result<String>
    where
        I: IntoIterator<Item = (&'a str, Variant)>,
    {
        let class = self.class_def(class_name)?;
        let mut stored = HashMap::new();
        for (name, value) in values {
            check_assignable(&class, name, &value)?;
            stored.insert(name.to_string(), value);
        }

        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let path = format!(r#"{}.InstanceID="{}""#, class.name, state.next_id);
        state.objects.insert(
            path.clone(),
            StoredObject {
                class: class.name.clone(),
                values: stored,
                pending: VecDeque::new(),
            },
        );
        Ok(path)
    }

    /// Insert a job whose `JobState` walks through `states`, one step per fetch.
    /// The first fetch observes `states[0]`.
    pub fn insert_job(&self, states: &[u16], error_code: u16, description: &str) -> Result<String> {
        const JOB_CLASS: &str = crate::hyperv::CONCRETE_JOB;
        if !self.has_class(JOB_CLASS) {
            self.define_class(ClassDef::concrete_job(JOB_CLASS));
        }

        let first = states.first().copied().unwrap_or(crate::job::JOB_STATE_COMPLETED);
        let path = self.insert_instance(
            JOB_CLASS,
            [
                ("JobState", Variant::I4(first as i32)),
                ("ErrorCode", Variant::I4(error_code as i32)),
                ("ErrorDescription", Variant::String(description.to_string())),
            ],
        )?;
        for state in states.iter().skip(1) {
            self.schedule_update(&path, "JobState", Variant::I4(*state as i32))?;
        }
        Ok(path)
    }

    /// Queue a property change. Each fetch of `path` observes the current values
    /// and then applies the oldest queued change.
    pub fn schedule_update(&self, path: &str, name: &str, value: Variant) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let object = state
            .objects
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        object.pending.push_back((name.to_string(), value));
        Ok(())
    }

    /// Overwrite a committed property immediately
    pub fn set_property(&self, path: &str, name: &str, value: Variant) -> Result<()> {
        let class_name = self.stored_class(path)?;
        let class = self.class_def(&class_name)?;
        check_assignable(&class, name, &value)?;
        let mut state = self.state.borrow_mut();
        if let Some(object) = state.objects.get_mut(path) {
            object.values.insert(name.to_string(), value);
        }
        Ok(())
    }

    pub fn remove_instance(&self, path: &str) -> bool {
        self.state.borrow_mut().objects.remove(path).is_some()
    }

    pub fn associate(&self, a: &str, b: &str) {
        self.state
            .borrow_mut()
            .associations
            .push((a.to_string(), b.to_string()));
    }

    /// Fetch a handle without recording a round trip
    pub fn object(&self, path: &str) -> Result<ObjectRef> {
        self.snapshot(path)?
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    pub fn class_object(&self, name: &str) -> Result<ObjectRef> {
        let class = self.class_def(name)?;
        Ok(self.class_handle(class))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Number of recorded reads of property `name`
    pub fn reads_of(&self, name: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Get(n) if n == name))
            .count()
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    fn class_def(&self, name: &str) -> Result<Rc<ClassDef>> {
        self.state
            .borrow()
            .classes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("class {}", name)))
    }

    fn stored_class(&self, path: &str) -> Result<String> {
        self.state
            .borrow()
            .objects
            .get(path)
            .map(|o| o.class.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn class_handle(&self, class: Rc<ClassDef>) -> ObjectRef {
        Rc::new(MemoryObject {
            broker: self.clone(),
            path: Some(class.name.clone()),
            is_class: true,
            values: RefCell::new(HashMap::new()),
            class,
        })
    }

    fn instance_handle(&self, class: Rc<ClassDef>, path: Option<String>, values: HashMap<String, Variant>) -> ObjectRef {
        Rc::new(MemoryObject {
            broker: self.clone(),
            class,
            path,
            is_class: false,
            values: RefCell::new(values),
        })
    }

    /// Resolve a class name or instance path. The object advances one pending
    /// update after being observed.
    fn snapshot(&self, path: &str) -> Result<Option<ObjectRef>> {
        if let Ok(class) = self.class_def(path) {
            return Ok(Some(self.class_handle(class)));
        }

        let (class_name, values) = {
            let mut state = self.state.borrow_mut();
            let Some(object) = state.objects.get_mut(path) else {
                return Ok(None);
            };
            let snapshot = (object.class.clone(), object.values.clone());
            if let Some((name, value)) = object.pending.pop_front() {
                object.values.insert(name, value);
            }
            snapshot
        };
        let class = self.class_def(&class_name)?;
        Ok(Some(self.instance_handle(class, Some(path.to_string()), values)))
    }

    fn instances_of(&self, class_name: &str) -> Vec<String> {
        self.state
            .borrow()
            .objects
            .iter()
            .filter(|(_, o)| o.class.eq_ignore_ascii_case(class_name))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn collect(&self, paths: Vec<String>) -> Result<Box<dyn RawEnum>> {
        let mut items = VecDeque::new();
        for path in paths {
            if let Some(object) = self.snapshot(&path)? {
                items.push_back(object);
            }
        }
        Ok(Box::new(MemoryEnum { items }))
    }

    fn run_query(&self, wql: &str) -> Result<Vec<String>> {
        match Query::parse(wql)? {
            Query::Select { class, filters } => {
                let mut matched = Vec::new();
                for path in self.instances_of(&class) {
                    if self.matches(&path, &filters)? {
                        matched.push(path);
                    }
                }
                Ok(matched)
            }
            Query::Associators { path, result_class } => {
                let state = self.state.borrow();
                Ok(state
                    .associations
                    .iter()
                    .filter_map(|(a, b)| match (a == &path, b == &path) {
                        (true, _) => Some(b.clone()),
                        (_, true) => Some(a.clone()),
                        _ => None,
                    })
                    .filter(|other| {
                        state
                            .objects
                            .get(other)
                            .is_some_and(|o| o.class.eq_ignore_ascii_case(&result_class))
                    })
                    .collect())
            }
            Query::References { path, result_class } => {
                let class = self.class_def(&result_class)?;
                let state = self.state.borrow();
                Ok(state
                    .objects
                    .iter()
                    .filter(|(_, o)| o.class == class.name)
                    .filter(|(_, o)| {
                        class.properties.iter().any(|(name, t)| {
                            t.is_reference() && o.values.get(name).and_then(Variant::as_str) == Some(path.as_str())
                        })
                    })
                    .map(|(p, _)| p.clone())
                    .collect())
            }
        }
    }

    fn matches(&self, path: &str, filters: &[(String, String)]) -> Result<bool> {
        let state = self.state.borrow();
        let Some(object) = state.objects.get(path) else {
            return Ok(false);
        };
        for (name, expected) in filters {
            let actual = match object.values.get(name) {
                Some(value) => String::from_variant(value)?,
                None => return Ok(false),
            };
            if &actual != expected {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Connector for MemoryBroker {
    fn connect(
        &self,
        _server: Option<&str>,
        namespace: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Connection>> {
        self.record(Call::Connect(namespace.to_string()));
        if let Some(required) = &self.state.borrow().credentials {
            if credentials != Some(required) {
                return Err(Error::Connection("Access denied".into()));
            }
        }
        Ok(Box::new(MemoryConnection { broker: self.clone() }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

impl Connection for MemoryConnection {
    fn exec_query(&self, wql: &str) -> Result<Box<dyn RawEnum>> {
        self.broker.record(Call::Query(wql.to_string()));
        let paths = self.broker.run_query(wql)?;
        self.broker.collect(paths)
    }

    fn create_instance_enum(&self, class_name: &str) -> Result<Box<dyn RawEnum>> {
        self.broker.record(Call::EnumClass(class_name.to_string()));
        self.broker.class_def(class_name)?;
        let paths = self.broker.instances_of(class_name);
        self.broker.collect(paths)
    }

    fn get_object(&self, path: &str) -> Result<Option<ObjectRef>> {
        self.broker.record(Call::GetObject(path.to_string()));
        self.broker.snapshot(path)
    }

    fn exec_method(
        &self,
        path: &str,
        method: &str,
        in_params: Option<ObjectRef>,
    ) -> Result<Option<ObjectRef>> {
        self.broker.record(Call::ExecMethod {
            path: path.to_string(),
            method: method.to_string(),
        });

        let class_name = match self.broker.class_def(path) {
            Ok(class) => class.name.clone(),
            Err(_) => self.broker.stored_class(path)?,
        };
        let class = self.broker.class_def(&class_name)?;
        let def = class
            .find_method(method)
            .cloned()
            .ok_or_else(|| Error::Remote(format!("method {}.{} not found", class_name, method)))?;
        let handler = def
            .handler
            .clone()
            .ok_or_else(|| Error::Remote(format!("method {}.{} is not implemented", class_name, method)))?;

        let inputs = match in_params {
            Some(params) => params.properties()?,
            None => PropertyBag::new(),
        };
        let call = MethodCall {
            broker: self.broker.clone(),
            target: path.to_string(),
            method: method.to_string(),
            inputs,
        };
        let results = handler(&call)?;

        let Some(out_class) = MethodDef::parameter_class(&def.outputs) else {
            return Ok(None);
        };
        let mut values = HashMap::new();
        for (name, value) in results {
            check_assignable(&out_class, &name, &value)?;
            values.insert(name, value);
        }
        Ok(Some(self.broker.instance_handle(out_class, None, values)))
    }
}

struct MemoryEnum {
    items: VecDeque<ObjectRef>,
}

impl RawEnum for MemoryEnum {
    fn next(&mut self) -> Result<Option<ObjectRef>> {
        Ok(self.items.pop_front())
    }
}

struct MemoryObject {
    broker: MemoryBroker,
    class: Rc<ClassDef>,
    path: Option<String>,
    is_class: bool,
    values: RefCell<HashMap<String, Variant>>,
}

impl MemoryObject {
    fn system_value(&self, name: &str) -> Option<Variant> {
        match name {
            PATH_PROPERTY => Some(
                self.path
                    .clone()
                    .map(Variant::String)
                    .unwrap_or(Variant::Null),
            ),
            CLASS_PROPERTY => Some(Variant::String(self.class.name.clone())),
            _ => None,
        }
    }
}

fn check_assignable(class: &ClassDef, name: &str, value: &Variant) -> Result<()> {
    let declared = class
        .declared(name)
        .ok_or_else(|| Error::NotFound(format!("property {} on {}", name, class.name)))?;
    if !declared.accepts(value) {
        return Err(Error::Remote(format!(
            "type mismatch: {}.{} is {}, got {}",
            class.name,
            name,
            declared,
            value.type_name()
        )));
    }
    Ok(())
}

impl RawObject for MemoryObject {
    fn get(&self, name: &str) -> Result<(Variant, CimType)> {
        self.broker.record(Call::Get(name.to_string()));
        if let Some(value) = self.system_value(name) {
            return Ok((value, CimType::scalar(CimBase::String)));
        }
        let cim_type = self
            .class
            .declared(name)
            .ok_or_else(|| Error::NotFound(format!("property {} on {}", name, self.class.name)))?;
        let value = self
            .values
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or(Variant::Null);
        Ok((value, cim_type))
    }

    fn put(&self, name: &str, value: &Variant) -> Result<()> {
        self.broker.record(Call::Put(name.to_string()));
        if name.starts_with("__") {
            return Err(Error::Remote(format!("system property {} is read-only", name)));
        }
        check_assignable(&self.class, name, value)?;
        let stored = match value {
            // embedded objects are copied, not shared
            Variant::Object(obj) => Variant::Object(obj.clone_object()?),
            other => other.clone(),
        };
        self.values.borrow_mut().insert(name.to_string(), stored);
        Ok(())
    }

    fn properties(&self) -> Result<PropertyBag> {
        let string = CimType::scalar(CimBase::String);
        let mut bag = PropertyBag::new();
        for system in [CLASS_PROPERTY, PATH_PROPERTY] {
            if let Some(value) = self.system_value(system) {
                bag.push(system, value, string);
            }
        }
        let values = self.values.borrow();
        for (name, cim_type) in &self.class.properties {
            let value = values.get(name).cloned().unwrap_or(Variant::Null);
            bag.push(name.clone(), value, *cim_type);
        }
        Ok(bag)
    }

    fn spawn_instance(&self) -> Result<ObjectRef> {
        if !self.is_class {
            return Err(Error::Remote(format!("{} is not a class definition", self.class.name)));
        }
        Ok(self
            .broker
            .instance_handle(Rc::clone(&self.class), None, HashMap::new()))
    }

    fn clone_object(&self) -> Result<ObjectRef> {
        Ok(Rc::new(MemoryObject {
            broker: self.broker.clone(),
            class: Rc::clone(&self.class),
            path: self.path.clone(),
            is_class: self.is_class,
            values: RefCell::new(self.values.borrow().clone()),
        }))
    }

    fn method_signature(&self, method: &str) -> Result<(Option<ObjectRef>, Option<ObjectRef>)> {
        let def = self
            .class
            .find_method(method)
            .ok_or_else(|| Error::NotFound(format!("method {}.{}", self.class.name, method)))?;
        let input = MethodDef::parameter_class(&def.inputs).map(|c| self.broker.class_handle(c));
        let output = MethodDef::parameter_class(&def.outputs).map(|c| self.broker.class_handle(c));
        Ok((input, output))
    }

    fn object_text(&self) -> Result<String> {
        let mut text = format!(r#"<INSTANCE CLASSNAME="{}">"#, xml_escape(&self.class.name));
        let values = self.values.borrow();
        for (name, cim_type) in &self.class.properties {
            let Some(value) = values.get(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let rendered = String::from_variant(value).unwrap_or_default();
            let _ = write!(
                text,
                r#"<PROPERTY NAME="{}" TYPE="{}"><VALUE>{}</VALUE></PROPERTY>"#,
                xml_escape(name),
                format!("{:?}", cim_type.base).to_lowercase(),
                xml_escape(&rendered)
            );
        }
        text.push_str("</INSTANCE>");
        Ok(text)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// The subset of WQL the in-process broker understands
#[derive(Debug, PartialEq)]
enum Query {
    Select { class: String, filters: Vec<(String, String)> },
    Associators { path: String, result_class: String },
    References { path: String, result_class: String },
}

impl Query {
    fn parse(wql: &str) -> Result<Self> {
        let unsupported = || Error::UnsupportedQuery(wql.to_string());
        let trimmed = wql.trim();
        let upper = trimmed.to_ascii_uppercase();

        for (keyword, associators) in [("ASSOCIATORS OF", true), ("REFERENCES OF", false)] {
            if !upper.starts_with(keyword) {
                continue;
            }
            let rest = trimmed[keyword.len()..].trim_start();
            let open = rest.strip_prefix('{').ok_or_else(unsupported)?;
            let close = open.find('}').ok_or_else(unsupported)?;
            let path = open[..close].trim().to_string();
            let clause = open[close + 1..].trim();
            let (name, value) = split_condition(
                strip_keyword(clause, "WHERE").ok_or_else(unsupported)?,
            )
            .ok_or_else(unsupported)?;
            if !name.eq_ignore_ascii_case("ResultClass") {
                return Err(unsupported());
            }
            let result_class = value;
            return Ok(if associators {
                Query::Associators { path, result_class }
            } else {
                Query::References { path, result_class }
            });
        }

        let rest = strip_keyword(trimmed, "SELECT").ok_or_else(unsupported)?;
        let from = rest.to_ascii_uppercase().find(" FROM ").ok_or_else(unsupported)?;
        let after_from = rest[from + " FROM ".len()..].trim();
        let (class, where_clause) = match after_from.find(char::is_whitespace) {
            Some(end) => (&after_from[..end], Some(after_from[end..].trim())),
            None => (after_from, None),
        };

        let mut filters = Vec::new();
        if let Some(clause) = where_clause.filter(|c| !c.is_empty()) {
            let conditions = strip_keyword(clause, "WHERE").ok_or_else(unsupported)?;
            for condition in split_and(conditions) {
                let (name, value) = split_condition(condition).ok_or_else(unsupported)?;
                filters.push((name.to_string(), value));
            }
        }

        Ok(Query::Select {
            class: class.to_string(),
            filters,
        })
    }
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let head = text.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(text[keyword.len()..].trim_start())
    } else {
        None
    }
}

fn split_and(conditions: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = conditions;
    while let Some(at) = rest.to_ascii_uppercase().find(" AND ") {
        parts.push(rest[..at].trim());
        rest = &rest[at + " AND ".len()..];
    }
    parts.push(rest.trim());
    parts
}

fn split_condition(condition: &str) -> Option<(&str, String)> {
    let (name, value) = condition.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .unwrap_or(value);
    Some((name.trim(), unescape_literal(value)))
}

fn unescape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}
