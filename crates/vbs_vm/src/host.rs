use vbs_syntax::Stmt;

use crate::error::VmError;
use crate::value::Value;

/// Capabilities the embedding application lends to the VM.
///
/// Every method has a default, so a host only overrides the parts it
/// intercepts. Names are passed lowercase.
pub trait Host {
    /// Read-side interception of a global. `None` falls through to the VM slot.
    fn get_variable(&mut self, _name: &str) -> Option<Value> {
        None
    }

    /// Observes every global write. The VM keeps its own slot regardless.
    fn set_variable(&mut self, _name: &str, _value: Value) {}

    /// Resolves a call the compiler could not bind (library and intrinsic
    /// functions). An error lets the VM try a user procedure of the same name
    /// before giving up.
    fn call_function(&mut self, name: &str, _args: Vec<Value>) -> Result<Value, VmError> {
        Err(VmError::host(format!("unknown function '{name}'")))
    }

    fn create_object(&mut self, prog_id: &str) -> Result<Value, VmError> {
        Err(VmError::host(format!("cannot create object '{prog_id}'")))
    }

    /// Element assignment on a value the VM cannot index itself.
    fn set_indexed(
        &mut self,
        object: Value,
        _indices: Vec<Value>,
        _value: Value,
    ) -> Result<(), VmError> {
        Err(VmError::ObjectRequired(object.type_name().to_string()))
    }

    /// Evaluates a statement the compiler left to the host.
    fn execute_ast(&mut self, _statement: &Stmt) -> Result<Option<Value>, VmError> {
        Ok(None)
    }
}

/// A host with no intercepts and no library functions.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHost;

impl Host for DefaultHost {}

/// An object owned by the host: class instances, dictionaries, `Response`.
///
/// Methods take `&self`; implementations keep their state behind interior
/// mutability since the VM hands out shared handles.
pub trait HostObject {
    fn type_name(&self) -> &str;

    fn get_property(&self, name: &str) -> Option<Value>;

    /// Returns false when the object has no such property.
    fn set_property(&self, name: &str, value: Value) -> bool;

    /// `name` is empty for the default member, as in `obj(1)`.
    fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value, VmError>;

    /// Items visited by `For Each`, or `None` if the object is not a collection.
    fn enumerate(&self) -> Option<Vec<Value>> {
        None
    }
}
