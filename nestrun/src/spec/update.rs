//! Tagged updates of optional spec fields.

use nestrun_shared::NestrunResult;
use oci_spec::runtime::Spec;

use super::builder::empty_linux;

/// An update to one optional field nested under the spec's `linux` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    /// Set the field. An absent `linux` section is created holding only
    /// this field; a present one keeps every other field.
    SetOrInsert(T),
}

impl FieldUpdate<String> {
    /// Apply to `linux.rootfsPropagation`.
    pub fn apply_rootfs_propagation(self, spec: &mut Spec) -> NestrunResult<()> {
        match self {
            FieldUpdate::SetOrInsert(value) => {
                let mut linux = match spec.linux() {
                    Some(linux) => linux.clone(),
                    None => empty_linux()?,
                };
                linux.set_rootfs_propagation(Some(value));
                spec.set_linux(Some(linux));
            }
        }
        Ok(())
    }
}
