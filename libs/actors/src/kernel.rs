//! Kernels
//!
//! The task-specific transform a compute actor runs on each fire. The actor
//! owns all register bookkeeping; a kernel only sees the input handles for
//! one piece and the write buffers of the acquired output registers, in
//! port declaration order. Output buffers arrive cleared and must not grow
//! beyond the port's register size.
//!
//! `KernelRegistry` maps the `kernel` name of a task descriptor to a
//! factory. The built-in kernels cover sources, pass-through stages and
//! sinks so plans can run without custom code.

use crate::error::KernelError;
use crate::register::RegisterHandle;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use types::{PieceId, TaskDescriptor};

pub trait Kernel: Send {
    fn execute(
        &mut self,
        piece: PieceId,
        inputs: &[RegisterHandle],
        outputs: &mut [BytesMut],
    ) -> Result<(), KernelError>;
}

/// Builds a kernel for a descriptor
pub type KernelFactory =
    Arc<dyn Fn(&TaskDescriptor) -> Result<Box<dyn Kernel>, KernelError> + Send + Sync>;

fn local_payload(handle: &RegisterHandle) -> Result<&Bytes, KernelError> {
    handle
        .payload()
        .ok_or_else(|| KernelError::new(format!("{} is not readable locally", handle.id())))
}

/// Source kernel writing the piece number as little-endian u64
#[derive(Debug, Default)]
pub struct CounterSource;

impl Kernel for CounterSource {
    fn execute(
        &mut self,
        piece: PieceId,
        _inputs: &[RegisterHandle],
        outputs: &mut [BytesMut],
    ) -> Result<(), KernelError> {
        for output in outputs {
            output.put_u64_le(piece.get());
        }
        Ok(())
    }
}

/// Copies input `i` to output `i`; extra outputs repeat the last input
#[derive(Debug, Default)]
pub struct Identity;

impl Kernel for Identity {
    fn execute(
        &mut self,
        _piece: PieceId,
        inputs: &[RegisterHandle],
        outputs: &mut [BytesMut],
    ) -> Result<(), KernelError> {
        let Some(last) = inputs.last() else {
            return Err(KernelError::new("identity requires at least one input"));
        };
        for (i, output) in outputs.iter_mut().enumerate() {
            let input = inputs.get(i).unwrap_or(last);
            output.extend_from_slice(local_payload(input)?);
        }
        Ok(())
    }
}

/// Writes the concatenation of all inputs to every output
#[derive(Debug, Default)]
pub struct Concat;

impl Kernel for Concat {
    fn execute(
        &mut self,
        _piece: PieceId,
        inputs: &[RegisterHandle],
        outputs: &mut [BytesMut],
    ) -> Result<(), KernelError> {
        for output in outputs {
            for input in inputs {
                output.extend_from_slice(local_payload(input)?);
            }
        }
        Ok(())
    }
}

/// Shared store a `Collect` sink appends to
#[derive(Debug, Clone, Default)]
pub struct Collected(Arc<Mutex<Vec<(PieceId, Vec<Bytes>)>>>);

impl Collected {
    pub fn pieces(&self) -> Vec<PieceId> {
        self.0.lock().iter().map(|(piece, _)| *piece).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<(PieceId, Vec<Bytes>)> {
        self.0.lock().clone()
    }
}

/// Sink kernel recording every piece it reads
#[derive(Debug, Clone, Default)]
pub struct Collect {
    store: Collected,
}

impl Collect {
    pub fn new(store: Collected) -> Self {
        Self { store }
    }
}

impl Kernel for Collect {
    fn execute(
        &mut self,
        piece: PieceId,
        inputs: &[RegisterHandle],
        _outputs: &mut [BytesMut],
    ) -> Result<(), KernelError> {
        let payloads = inputs
            .iter()
            .map(|input| local_payload(input).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        self.store.0.lock().push((piece, payloads));
        Ok(())
    }
}

/// Name to factory lookup used when launching a graph
#[derive(Clone, Default)]
pub struct KernelRegistry {
    factories: HashMap<String, KernelFactory>,
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("KernelRegistry").field("kernels", &names).finish()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `counter`, `identity`, `concat` and a `collect` sink
    /// writing into `collected`
    pub fn with_builtins(collected: Collected) -> Self {
        let mut registry = Self::new();
        registry.register("counter", |_| Ok(Box::new(CounterSource)));
        registry.register("identity", |_| Ok(Box::new(Identity)));
        registry.register("concat", |_| Ok(Box::new(Concat)));
        registry.register("collect", move |_| {
            Ok(Box::new(Collect::new(collected.clone())))
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&TaskDescriptor) -> Result<Box<dyn Kernel>, KernelError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate the kernel a descriptor names
    pub fn build(&self, task: &TaskDescriptor) -> Result<Box<dyn Kernel>, KernelError> {
        let name = task
            .kernel
            .as_deref()
            .ok_or_else(|| KernelError::new(format!("{} names no kernel", task.id)))?;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| KernelError::new(format!("unknown kernel '{name}'")))?;
        factory(task)
    }
}
