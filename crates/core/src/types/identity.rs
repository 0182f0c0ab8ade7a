use std::fmt;

const VM_NAME_PREFIX: &str = "docker-machine";

/// The pair a VM name is derived from. Nothing about it is stored; the same
/// operator and machine name always produce the same VM name, which is how a
/// later process finds a VM started by an earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    operator: String,
    machine: String,
}

impl VmIdentity {
    pub fn new(operator: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            machine: machine.into(),
        }
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Host-unique name used for `/dev/vmm/<name>` and all hypervisor tools.
    pub fn vm_name(&self) -> String {
        format!("{VM_NAME_PREFIX}-{}-{}", self.operator, self.machine)
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.vm_name())
    }
}
