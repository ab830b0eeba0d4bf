//! Value marshalling between host and guest
//!
//! Conversion is deep: arrays become tables and tables become arrays, key by
//! key. A structure that contains itself is rejected; one that merely shares
//! substructures is converted normally, with the shared parts duplicated.
//! No adjustment is made between the guest's 1-based sequences and the
//! host's 0-based lists.

use std::collections::HashSet;
use std::rc::Rc;

use mlua::{Function, Table, Value};

use super::function::FunctionHandle;
use super::sandbox::{guest_error, SandboxCore};
use super::value::{ArrayKey, HostArray, HostValue};
use crate::error::{MarshalError, SandboxError};

/// Largest magnitude at which every integer is exactly representable as f64
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Host numeric value for a guest float
fn number_to_host(n: f64) -> HostValue {
    if n.fract() == 0.0 && n.abs() <= MAX_EXACT_INTEGER {
        HostValue::Int(n as i64)
    } else {
        HostValue::Float(n)
    }
}

/// One conversion pass. Tracks the structures on the current descent path.
pub(crate) struct Marshaller<'a> {
    core: &'a Rc<SandboxCore>,
    visiting: HashSet<usize>,
    depth: usize,
    max_depth: usize,
}

impl<'a> Marshaller<'a> {
    pub fn new(core: &'a Rc<SandboxCore>) -> Self {
        Marshaller {
            core,
            visiting: HashSet::new(),
            depth: 0,
            max_depth: core.config.max_conversion_depth,
        }
    }

    fn enter(&mut self, identity: usize) -> Result<(), SandboxError> {
        if self.depth >= self.max_depth {
            return Err(MarshalError::TooDeep(self.max_depth).into());
        }
        if !self.visiting.insert(identity) {
            return Err(MarshalError::CyclicValue.into());
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self, identity: usize) {
        self.visiting.remove(&identity);
        self.depth -= 1;
    }

    pub fn to_guest_many(&mut self, values: &[HostValue]) -> Result<Vec<Value>, SandboxError> {
        values.iter().map(|value| self.to_guest(value)).collect()
    }

    pub fn to_guest(&mut self, value: &HostValue) -> Result<Value, SandboxError> {
        let lua = &self.core.lua;
        match value {
            HostValue::Null => Ok(Value::Nil),
            HostValue::Bool(b) => Ok(Value::Boolean(*b)),
            HostValue::Int(i) => Ok(Value::Integer(*i)),
            HostValue::Float(f) => Ok(Value::Number(*f)),
            HostValue::String(bytes) => lua.create_string(bytes).map(Value::String).map_err(guest_error),
            HostValue::Array(array) => {
                let identity = array.identity();
                self.enter(identity)?;
                let table = self.array_to_table(array);
                self.leave(identity);
                table.map(Value::Table)
            }
            HostValue::Reference(cell) => {
                let identity = Rc::as_ptr(cell) as *const () as usize;
                self.enter(identity)?;
                let inner = cell.borrow().clone();
                let converted = self.to_guest(&inner);
                self.leave(identity);
                converted
            }
            HostValue::Callable(func) => self.core.wrap_host(func).map(Value::Function).map_err(guest_error),
            HostValue::Function(handle) => handle.function(self.core).map(Value::Function),
            HostValue::Opaque(class) => Err(MarshalError::Unsupported(format!("object ({})", class)).into()),
        }
    }

    fn array_to_table(&mut self, array: &HostArray) -> Result<Table, SandboxError> {
        let entries = array.entries();
        let sequential = entries
            .iter()
            .filter(|(key, _)| matches!(key, ArrayKey::Int(_)))
            .count();
        let table = self
            .core
            .lua
            .create_table_with_capacity(sequential, entries.len() - sequential)
            .map_err(guest_error)?;
        for (key, value) in &entries {
            let key = match key {
                ArrayKey::Int(n) => Value::Integer(*n),
                ArrayKey::Str(bytes) => Value::String(self.core.lua.create_string(bytes).map_err(guest_error)?),
            };
            let value = self.to_guest(value)?;
            table.raw_set(key, value).map_err(guest_error)?;
        }
        Ok(table)
    }

    pub fn to_host_many<I>(&mut self, values: I) -> Result<Vec<HostValue>, SandboxError>
    where
        I: IntoIterator<Item = Value>,
    {
        values.into_iter().map(|value| self.to_host(value)).collect()
    }

    pub fn to_host(&mut self, value: Value) -> Result<HostValue, SandboxError> {
        match value {
            Value::Nil => Ok(HostValue::Null),
            Value::Boolean(b) => Ok(HostValue::Bool(b)),
            Value::Integer(i) => Ok(HostValue::Int(i)),
            Value::Number(n) => Ok(number_to_host(n)),
            Value::String(s) => Ok(HostValue::String(s.as_bytes().to_vec())),
            Value::Table(table) => {
                let identity = table.to_pointer() as usize;
                self.enter(identity)?;
                let array = self.table_to_array(&table);
                self.leave(identity);
                array.map(HostValue::Array)
            }
            Value::Function(func) => FunctionHandle::from_guest(self.core, func)
                .map(HostValue::Function)
                .map_err(guest_error),
            other => Err(MarshalError::Unsupported(other.type_name().to_string()).into()),
        }
    }

    fn table_to_array(&mut self, table: &Table) -> Result<HostArray, SandboxError> {
        let array = HostArray::new();
        for (key, value) in self.table_entries(table)? {
            let key = self.key_to_host(key)?;
            let value = self.to_host(value)?;
            let printable = key.to_string();
            if !array.insert_new(key, value) {
                return Err(MarshalError::KeyCollision(printable).into());
            }
        }
        Ok(array)
    }

    /// Table contents, through `__pairs` or `__ipairs` when the table has one
    fn table_entries(&mut self, table: &Table) -> Result<Vec<(Value, Value)>, SandboxError> {
        if let Some(metatable) = table.metatable() {
            for event in ["__pairs", "__ipairs"] {
                if let Value::Function(iterator_factory) = metatable.raw_get(event).map_err(guest_error)? {
                    return self.iterate_with(&iterator_factory, table);
                }
            }
        }
        table
            .pairs::<Value, Value>()
            .collect::<mlua::Result<Vec<_>>>()
            .map_err(guest_error)
    }

    fn iterate_with(&mut self, factory: &Function, table: &Table) -> Result<Vec<(Value, Value)>, SandboxError> {
        let (next, state, mut control): (Function, Value, Value) =
            factory.call(table.clone()).map_err(guest_error)?;
        let mut entries = Vec::new();
        loop {
            let (key, value): (Value, Value) = next.call((state.clone(), control)).map_err(guest_error)?;
            if key.is_nil() {
                break;
            }
            control = key.clone();
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// String key for a float: the interpreter's printed form when it reads
    /// back as the same number, else the shortest exact form
    fn float_key(&self, n: f64) -> Result<Vec<u8>, SandboxError> {
        let printed = self.core.lua.coerce_string(Value::Number(n)).map_err(guest_error)?;
        if let Some(printed) = printed {
            let bytes = printed.as_bytes().to_vec();
            let exact = std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<f64>().ok())
                .map_or(false, |parsed| parsed == n);
            if exact {
                return Ok(bytes);
            }
        }
        Ok(format!("{:?}", n).into_bytes())
    }

    fn key_to_host(&self, key: Value) -> Result<ArrayKey, SandboxError> {
        match key {
            Value::Integer(i) => Ok(ArrayKey::Int(i)),
            Value::Number(n) => match number_to_host(n) {
                HostValue::Int(i) => Ok(ArrayKey::Int(i)),
                _ => Ok(ArrayKey::Str(self.float_key(n)?)),
            },
            Value::String(s) => Ok(ArrayKey::from_bytes(&s.as_bytes())),
            other => Err(MarshalError::Unsupported(format!("{} key", other.type_name())).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_coercion() {
        assert_eq!(number_to_host(3.0), HostValue::Int(3));
        assert_eq!(number_to_host(-0.0), HostValue::Int(0));
        assert_eq!(number_to_host(2.5), HostValue::Float(2.5));
        assert_eq!(number_to_host(MAX_EXACT_INTEGER), HostValue::Int(1 << 53));
        assert_eq!(number_to_host(MAX_EXACT_INTEGER * 2.0), HostValue::Float(MAX_EXACT_INTEGER * 2.0));
        assert_eq!(number_to_host(f64::INFINITY), HostValue::Float(f64::INFINITY));
        assert!(matches!(number_to_host(f64::NAN), HostValue::Float(x) if x.is_nan()));
    }
}
