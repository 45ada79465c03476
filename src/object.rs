// File: src/object.rs
//
// Heap object bodies for the Cinder VM and the interning string pool.
// Objects are handed out as Rc handles; the parts of the data model that
// mutate after construction (instance fields, class method tables, upvalues)
// use interior mutability.

use crate::bytecode::Chunk;
use crate::table::Table;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// An immutable string with its FNV-1a hash computed once at creation.
///
/// The pool guarantees at most one live `ObjString` per byte sequence, so
/// content equality reduces to handle identity everywhere else.
#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// FNV-1a, 32 bit: xor then multiply per byte.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// The intern table. Every string the compiler or VM constructs goes through
/// here, so identical contents always share one handle.
#[derive(Debug, Default)]
pub struct StringPool {
    strings: Table,
}

impl StringPool {
    pub fn new() -> StringPool {
        StringPool { strings: Table::new() }
    }

    /// Returns the canonical handle for `chars`, creating it on first use.
    pub fn intern(&mut self, chars: &str) -> Rc<ObjString> {
        let hash = hash_string(chars);
        if let Some(existing) = self.strings.find_string(chars, hash) {
            return existing;
        }
        self.insert(chars.into(), hash)
    }

    /// Concatenates two strings. The joined buffer is discarded again if an
    /// identical string is already interned.
    pub fn concatenate(&mut self, a: &ObjString, b: &ObjString) -> Rc<ObjString> {
        let mut joined = String::with_capacity(a.chars.len() + b.chars.len());
        joined.push_str(&a.chars);
        joined.push_str(&b.chars);
        let hash = hash_string(&joined);
        if let Some(existing) = self.strings.find_string(&joined, hash) {
            return existing;
        }
        self.insert(joined.into_boxed_str(), hash)
    }

    fn insert(&mut self, chars: Box<str>, hash: u32) -> Rc<ObjString> {
        let string = Rc::new(ObjString { chars, hash });
        // The pool registers strings as a key set; the value is unused.
        self.strings.set(Rc::clone(&string), Value::Nil);
        string
    }
}

/// A compiled function: its bytecode plus call metadata. Produced only by
/// the compiler; executed only through a closure wrapper.
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    /// None for the implicit top-level script function.
    pub name: Option<Rc<ObjString>>,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: Option<Rc<ObjString>>) -> Function {
        Function { arity: 0, upvalue_count: 0, name, chunk: Chunk::new() }
    }
}

/// Host function: receives the argument window, always returns a value.
pub type NativeFn = fn(args: &[Value]) -> Value;

#[derive(Debug)]
pub struct ObjNative {
    pub function: NativeFn,
}

/// A captured variable. Open while its variable still lives on the operand
/// stack (addressed by slot index), closed once the value has been hoisted
/// into the upvalue itself.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A function plus the upvalues its body captures.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>) -> Closure {
        Closure { function, upvalues: Vec::new() }
    }
}

#[derive(Debug)]
pub struct Class {
    pub name: Rc<ObjString>,
    pub methods: RefCell<Table>,
}

impl Class {
    pub fn new(name: Rc<ObjString>) -> Class {
        Class { name, methods: RefCell::new(Table::new()) }
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: Rc<Class>,
    pub fields: RefCell<Table>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Instance {
        Instance { class, fields: RefCell::new(Table::new()) }
    }
}

/// A method closure snapped together with the receiver it was accessed on.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}
