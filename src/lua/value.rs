//! Host-side value model
//!
//! `HostValue` is what the embedding application hands to and receives from
//! the sandbox. Associative arrays keep insertion order explicitly, and keys
//! follow the host convention where canonical integer strings ("0", "-7")
//! are the same key as the integer itself.
//!
//! An array may contain itself. Printing shows the repeated array as
//! `[...]`, and comparing treats a pair already under comparison as equal.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::thread::LocalKey;

use super::function::{FunctionHandle, HostFunction};

/// Shared, mutable host reference. Dereferenced when crossing into the guest.
pub type HostRef = Rc<RefCell<HostValue>>;

/// A value in the host domain
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    /// Absence of a value
    Null,

    /// Boolean
    Bool(bool),

    /// Integer
    Int(i64),

    /// Float, including infinities and NaN
    Float(f64),

    /// Byte string, no encoding implied
    String(Vec<u8>),

    /// Ordered associative array
    Array(HostArray),

    /// Reference parameter; only its current value is converted
    Reference(HostRef),

    /// Host callable, exposed to the guest through a trampoline
    Callable(HostFunction),

    /// Function living in a sandbox
    Function(FunctionHandle),

    /// Host object with no guest counterpart; carries the class name
    Opaque(String),
}

impl HostValue {
    /// Wrap a value in a fresh reference cell
    pub fn reference(value: HostValue) -> Self {
        HostValue::Reference(Rc::new(RefCell::new(value)))
    }

    /// Short type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::String(_) => "string",
            HostValue::Array(_) => "array",
            HostValue::Reference(_) => "reference",
            HostValue::Callable(_) => "callable",
            HostValue::Function(_) => "function",
            HostValue::Opaque(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as a float, for either numeric variant
    pub fn as_float(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// String contents if they are valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn as_array(&self) -> Option<&HostArray> {
        match self {
            HostValue::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionHandle> {
        match self {
            HostValue::Function(handle) => Some(handle),
            _ => None,
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Int(value as i64)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.as_bytes().to_vec())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value.into_bytes())
    }
}

impl From<&[u8]> for HostValue {
    fn from(value: &[u8]) -> Self {
        HostValue::String(value.to_vec())
    }
}

impl From<HostArray> for HostValue {
    fn from(value: HostArray) -> Self {
        HostValue::Array(value)
    }
}

impl From<HostFunction> for HostValue {
    fn from(value: HostFunction) -> Self {
        HostValue::Callable(value)
    }
}

impl From<FunctionHandle> for HostValue {
    fn from(value: FunctionHandle) -> Self {
        HostValue::Function(value)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(values: Vec<HostValue>) -> Self {
        HostValue::Array(HostArray::from_list(values))
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Int(i) => write!(f, "{}", i),
            HostValue::Float(x) => write!(f, "{:?}", x),
            HostValue::String(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            HostValue::Array(array) => {
                unless_active(&PRINTING, array.identity(), || array.write_entries(f)).unwrap_or_else(|| write!(f, "[...]"))
            }
            HostValue::Reference(cell) => match cell.try_borrow() {
                Ok(value) => write!(f, "&{}", value),
                Err(_) => write!(f, "&<borrowed>"),
            },
            HostValue::Callable(func) => write!(f, "<host function {}>", func.name()),
            HostValue::Function(handle) => {
                if handle.is_host() {
                    write!(f, "<function (host)>")
                } else {
                    write!(f, "<function>")
                }
            }
            HostValue::Opaque(class) => write!(f, "<object {}>", class),
        }
    }
}

thread_local! {
    /// Arrays being printed on this thread
    static PRINTING: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());

    /// Array pairs being compared on this thread
    static COMPARING: RefCell<HashSet<(usize, usize)>> = RefCell::new(HashSet::new());
}

/// Run `f` with `key` marked active, or return `None` if it already is
fn unless_active<K, R>(active: &'static LocalKey<RefCell<HashSet<K>>>, key: K, f: impl FnOnce() -> R) -> Option<R>
where
    K: Copy + Eq + Hash + 'static,
{
    if !active.with(|set| set.borrow_mut().insert(key)) {
        return None;
    }
    let result = f();
    active.with(|set| set.borrow_mut().remove(&key));
    Some(result)
}

/// Key of a host associative array
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    Int(i64),
    Str(Vec<u8>),
}

impl ArrayKey {
    /// Build a key from raw bytes, folding canonical integer strings into
    /// integer keys
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match canonical_int(bytes) {
            Some(n) => ArrayKey::Int(n),
            None => ArrayKey::Str(bytes.to_vec()),
        }
    }
}

/// Parse a decimal integer written exactly as the integer would print
fn canonical_int(bytes: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(bytes).ok()?;
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if text == "-0" {
        return None;
    }
    text.parse::<i64>().ok()
}

impl From<i64> for ArrayKey {
    fn from(value: i64) -> Self {
        ArrayKey::Int(value)
    }
}

impl From<&str> for ArrayKey {
    fn from(value: &str) -> Self {
        ArrayKey::from_bytes(value.as_bytes())
    }
}

impl From<String> for ArrayKey {
    fn from(value: String) -> Self {
        ArrayKey::from_bytes(value.as_bytes())
    }
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayKey::Int(n) => write!(f, "{}", n),
            ArrayKey::Str(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
        }
    }
}

/// Insertion-ordered associative array with shared ownership.
///
/// Cloning a `HostArray` clones the handle, not the contents; the marshaller
/// uses handle identity for cycle detection.
#[derive(Clone, Default)]
pub struct HostArray {
    inner: Rc<RefCell<ArrayData>>,
}

#[derive(Default)]
struct ArrayData {
    entries: Vec<(ArrayKey, HostValue)>,
    index: HashMap<ArrayKey, usize>,
    next_int: i64,
}

impl ArrayData {
    fn bump_next_int(&mut self, key: &ArrayKey) {
        if let ArrayKey::Int(n) = key {
            if *n >= self.next_int {
                self.next_int = n.saturating_add(1);
            }
        }
    }
}

impl HostArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// List with keys 0, 1, 2, ...
    pub fn from_list<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<HostValue>,
    {
        let array = HostArray::new();
        for value in values {
            array.push(value.into());
        }
        array
    }

    /// Array built from key/value pairs; later duplicates replace earlier ones
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<ArrayKey>,
        V: Into<HostValue>,
    {
        let array = HostArray::new();
        for (key, value) in pairs {
            array.insert(key.into(), value.into());
        }
        array
    }

    /// Append under the next free integer key
    pub fn push(&self, value: HostValue) {
        let key = ArrayKey::Int(self.inner.borrow().next_int);
        self.insert(key, value);
    }

    /// Insert or replace; replacement keeps the original position
    pub fn insert(&self, key: ArrayKey, value: HostValue) -> Option<HostValue> {
        let mut data = self.inner.borrow_mut();
        if let Some(&pos) = data.index.get(&key) {
            return Some(std::mem::replace(&mut data.entries[pos].1, value));
        }
        data.bump_next_int(&key);
        let pos = data.entries.len();
        data.index.insert(key.clone(), pos);
        data.entries.push((key, value));
        None
    }

    /// Insert only if the key is absent. Returns false on collision.
    pub fn insert_new(&self, key: ArrayKey, value: HostValue) -> bool {
        let mut data = self.inner.borrow_mut();
        if data.index.contains_key(&key) {
            return false;
        }
        data.bump_next_int(&key);
        let pos = data.entries.len();
        data.index.insert(key.clone(), pos);
        data.entries.push((key, value));
        true
    }

    pub fn get(&self, key: &ArrayKey) -> Option<HostValue> {
        let data = self.inner.borrow();
        data.index.get(key).map(|&pos| data.entries[pos].1.clone())
    }

    pub fn contains_key(&self, key: &ArrayKey) -> bool {
        self.inner.borrow().index.contains_key(key)
    }

    pub fn remove(&self, key: &ArrayKey) -> Option<HostValue> {
        let mut data = self.inner.borrow_mut();
        let pos = data.index.remove(key)?;
        let (_, value) = data.entries.remove(pos);
        for slot in data.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the entries in insertion order
    pub fn entries(&self) -> Vec<(ArrayKey, HostValue)> {
        self.inner.borrow().entries.clone()
    }

    pub fn keys(&self) -> Vec<ArrayKey> {
        self.inner.borrow().entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<HostValue> {
        self.inner.borrow().entries.iter().map(|(_, v)| v.clone()).collect()
    }

    /// True when both handles point at the same array
    pub fn ptr_eq(&self, other: &HostArray) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    fn write_entries(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (key, value)) in self.entries().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match key {
                ArrayKey::Int(n) => write!(f, "{} => {}", n, value)?,
                ArrayKey::Str(_) => write!(f, "{:?} => {}", key.to_string(), value)?,
            }
        }
        write!(f, "]")
    }
}

/// Same keys mapping to equal values; order is not significant
impl PartialEq for HostArray {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        unless_active(&COMPARING, (self.identity(), other.identity()), || {
            let mine = self.inner.borrow();
            let theirs = other.inner.borrow();
            mine.entries.len() == theirs.entries.len()
                && mine.entries.iter().all(|(key, value)| {
                    theirs
                        .index
                        .get(key)
                        .map_or(false, |&pos| theirs.entries[pos].1 == *value)
                })
        })
        .unwrap_or(true)
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(data) = self.inner.try_borrow() else {
            return write!(f, "HostArray(<borrowed>)");
        };
        unless_active(&PRINTING, self.identity(), || {
            f.debug_map().entries(data.entries.iter().map(|(k, v)| (k, v))).finish()
        })
        .unwrap_or_else(|| write!(f, "[...]"))
    }
}
