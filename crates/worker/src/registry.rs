// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! The process-wide registered-task table.
//!
//! Task libraries register their functions explicitly through
//! [`register_task!`]; the registrations are collected by `inventory` at
//! link time and assembled into a [`TaskRegistry`] at startup, filtered by
//! the library names enabled on the command line. There is no hidden
//! static-initialization ordering to trip over: until `TaskRegistry::load`
//! runs, nothing has been looked at.

use std::{collections::HashMap, sync::Arc};

use dal::ID;
use models::Data;
use storage::DataStorage;

use crate::error::{RegistryError, TaskExecutionError};

/// One registered task function plus the metadata the runtime needs to wire
/// it into a graph.
pub struct TaskFunction {
    pub name: &'static str,

    /// The task library this function ships in; selected via `--libs`.
    pub library: &'static str,

    pub input_types: &'static [&'static str],
    pub output_types: &'static [&'static str],

    /// Type-erased shim: deserializes the argument buffers, invokes the
    /// user function, serializes the results.
    pub call: fn(&TaskContext, &[Vec<u8>]) -> Result<Vec<Vec<u8>>, TaskExecutionError>,
}

inventory::collect!(TaskFunction);

pub struct TaskRegistry {
    by_name: HashMap<&'static str, &'static TaskFunction>,
}

impl TaskRegistry {
    /// Assembles the registry from every function linked into this binary,
    /// keeping only those in the named libraries. Naming a library nothing
    /// registered under is a command-line error.
    pub fn load(libs: &[String]) -> Result<Self, RegistryError> {
        let all: Vec<&'static TaskFunction> = inventory::iter::<TaskFunction>.into_iter().collect();

        for lib in libs {
            if !all.iter().any(|f| f.library == lib) {
                return Err(RegistryError::UnknownLibrary(lib.clone()));
            }
        }

        let mut by_name: HashMap<&'static str, &'static TaskFunction> = HashMap::new();
        for function in all {
            if !libs.iter().any(|l| l == function.library) {
                continue;
            }
            if by_name.insert(function.name, function).is_some() {
                return Err(RegistryError::DuplicateFunction(function.name.to_owned()));
            }
        }

        tracing::debug!(
            "task registry loaded with {} function(s): {:?}",
            by_name.len(),
            by_name.keys().collect::<Vec<_>>()
        );

        Ok(Self { by_name })
    }

    pub fn get(&self, name: &str) -> Option<&'static TaskFunction> {
        self.by_name.get(name).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Handle passed to every task function: its identity plus scoped access to
/// the blob store for user-owned data.
pub struct TaskContext {
    task_id: ID,
    instance_id: ID,
    data: Arc<dyn DataStorage>,
    handle: tokio::runtime::Handle,
}

impl TaskContext {
    pub fn new(
        task_id: ID,
        instance_id: ID,
        data: Arc<dyn DataStorage>,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            task_id,
            instance_id,
            data,
            handle,
        }
    }

    pub fn task_id(&self) -> ID {
        self.task_id
    }

    pub fn instance_id(&self) -> ID {
        self.instance_id
    }

    /// Creates a blob owned by this task and returns its id; the id is what
    /// a `data`-typed output slot carries.
    pub fn create_data(&self, value: Vec<u8>) -> Result<ID, TaskExecutionError> {
        self.create_data_with(value, false, false, Vec::new())
    }

    pub fn create_data_with(
        &self,
        value: Vec<u8>,
        persisted: bool,
        hard_locality: bool,
        locality: Vec<String>,
    ) -> Result<ID, TaskExecutionError> {
        let mut data = Data::new(value, models::DataOwner::Task(self.task_id));
        data.set_persisted(persisted);
        data.set_hard_locality(hard_locality);
        data.set_locality(locality);
        let id = data.id;

        let store = self.data.clone();
        let task_id = self.task_id;
        self.handle
            .block_on(async move { store.add_task_data(task_id, &data).await })?;

        Ok(id)
    }

    pub fn get_data(&self, id: ID) -> Result<Vec<u8>, TaskExecutionError> {
        let store = self.data.clone();
        let data = self.handle.block_on(async move { store.get_data(id).await })?;
        Ok(data.value)
    }
}

/// Support items the [`register_task!`] expansion leans on. Not part of the
/// public surface.
pub mod macro_support {
    pub use models::{decode_value, encode_value, TypeTag};
}

pub mod macro_reexport {
    pub use inventory::*;
}

/// Registers a task function under a library name.
///
/// ```ignore
/// fn sum(_ctx: &TaskContext, a: i64, b: i64) -> Result<i64, String> {
///     Ok(a + b)
/// }
/// worker::register_task!(quick_start, sum(a: i64, b: i64) -> i64);
/// ```
#[macro_export]
macro_rules! register_task {
    ($library:ident, $func:ident ( $($arg:ident : $ty:ty),* $(,)? ) -> $ret:ty) => {
        $crate::registry::macro_reexport::submit! {
            $crate::registry::TaskFunction {
                name: stringify!($func),
                library: stringify!($library),
                input_types: &[
                    $(<$ty as $crate::registry::macro_support::TypeTag>::TYPE_TAG),*
                ],
                output_types: &[
                    <$ret as $crate::registry::macro_support::TypeTag>::TYPE_TAG
                ],
                call: {
                    fn shim(
                        context: &$crate::registry::TaskContext,
                        args: &[Vec<u8>],
                    ) -> Result<Vec<Vec<u8>>, $crate::error::TaskExecutionError> {
                        let mut buffers = args.iter();
                        $(
                            let $arg: $ty = match buffers.next() {
                                Some(buffer) => {
                                    $crate::registry::macro_support::decode_value(buffer)
                                        .map_err(|e| {
                                            $crate::error::TaskExecutionError::ArgumentInvalid(
                                                format!(
                                                    "argument `{}` of {}: {e}",
                                                    stringify!($arg),
                                                    stringify!($func),
                                                ),
                                            )
                                        })?
                                }
                                None => {
                                    return Err(
                                        $crate::error::TaskExecutionError::ArgumentInvalid(
                                            format!(
                                                "{} is missing argument `{}`",
                                                stringify!($func),
                                                stringify!($arg),
                                            ),
                                        ),
                                    )
                                }
                            };
                        )*
                        if buffers.next().is_some() {
                            return Err($crate::error::TaskExecutionError::ArgumentInvalid(
                                format!("too many arguments for {}", stringify!($func)),
                            ));
                        }

                        let result = $func(context, $($arg),*).map_err(|e| {
                            $crate::error::TaskExecutionError::TaskFailed(e.to_string())
                        })?;

                        let buffer = $crate::registry::macro_support::encode_value(&result)
                            .map_err(|e| {
                                $crate::error::TaskExecutionError::OutputInvalid(e.to_string())
                            })?;
                        Ok(vec![buffer])
                    }
                    shim
                },
            }
        }
    };
}
