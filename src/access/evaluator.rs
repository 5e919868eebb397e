use super::permission::{has_permission, Permission};

/// Allow when the credential mask carries Administrator (superuser bypass,
/// not set membership), or when every required permission bit is present.
/// An empty required set allows any authenticated credential.
pub fn is_allowed(mask: u32, required: &[Permission]) -> bool {
    if has_permission(mask, Permission::Administrator) {
        return true;
    }
    required.iter().all(|p| has_permission(mask, *p))
}
