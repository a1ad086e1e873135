use uuid::Uuid;

/// Prefix of placeholder ids assigned to entities created while offline.
pub const LOCAL_ID_PREFIX: &str = "local:";

pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// A fresh placeholder id for an entity the server has not seen yet.
pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}
