use serde::{Deserialize, Serialize};

use crate::core::{Output, Value};
use crate::error::Error;
use crate::resource::{ResourceKey, ResourceService};
use crate::stamp::{OutputStamp, ResourceStamp};
use crate::task::{Registry, TaskKey};

/// The caller observed the output of `callee` through `stamp.stamper`, and the
/// stamp was `stamp.value` at the time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRequireDep {
    pub callee: TaskKey,
    pub stamp: OutputStamp,
}

impl TaskRequireDep {
    /// Restamps `output` of the callee. Returns the new stamp when it differs
    /// from the recorded one.
    pub fn check(&self, output: &Value, registry: &Registry) -> Result<Option<OutputStamp>, Error> {
        let stamp = self.stamp.stamper.stamp(output, registry)?;
        Ok((stamp != self.stamp).then_some(stamp))
    }
}

/// The task read the resource `key`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequireDep {
    pub key: ResourceKey,
    pub stamp: ResourceStamp,
}

/// The task wrote the resource `key`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceProvideDep {
    pub key: ResourceKey,
    pub stamp: ResourceStamp,
}

macro_rules! resource_check {
    ($dep:ty) => {
        impl $dep {
            /// Restamps the resource. Returns the new stamp when it differs
            /// from the recorded one.
            pub fn check(
                &self,
                resources: &dyn ResourceService,
            ) -> Result<Option<ResourceStamp>, Error> {
                let resource = resources
                    .resource(&self.key)
                    .map_err(|e| Error::resource(&self.key, e))?;
                let stamp = self
                    .stamp
                    .stamper
                    .stamp(resource.as_ref())
                    .map_err(|e| Error::resource(&self.key, e))?;
                Ok((stamp != self.stamp).then_some(stamp))
            }
        }
    };
}

resource_check!(ResourceRequireDep);
resource_check!(ResourceProvideDep);

/// Everything recorded about a task instance by its most recent successful
/// execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    pub input: Value,
    pub output: Output,
    pub task_requires: Vec<TaskRequireDep>,
    pub resource_requires: Vec<ResourceRequireDep>,
    pub resource_provides: Vec<ResourceProvideDep>,
}

impl TaskData {
    pub fn new(input: Value, output: Output) -> Self {
        Self {
            input,
            output,
            task_requires: Vec::new(),
            resource_requires: Vec::new(),
            resource_provides: Vec::new(),
        }
    }
}
