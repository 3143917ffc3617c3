use keel_core::{Actions, KeelError, KeelResult, UpdateRequest, Version};

/// Stamp translated actions with the version observed in this cycle. Order is kept as given.
pub fn compose(actions: Actions, expected_version: Version) -> KeelResult<UpdateRequest> {
    if expected_version < 1 {
        return Err(KeelError::malformed("version", "expected version must be at least 1"));
    }
    debug_assert!(
        actions.windows(2).all(|w| w[0].field() < w[1].field()),
        "actions must be unique per field group and in declaration order"
    );
    Ok(UpdateRequest { expected_version, actions })
}
