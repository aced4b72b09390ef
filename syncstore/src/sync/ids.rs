//! Identifiers for clients, client groups and requests.

use rand::Rng;

/// Identifies a single client instance.
pub type ClientId = String;

/// Identifies a group of clients sharing one persisted state.
pub type ClientGroupId = String;

/// Random id, 16 bytes in lowercase base32.
fn random_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    data_encoding::BASE32_NOPAD
        .encode(&bytes)
        .to_ascii_lowercase()
}

/// A new random client id.
pub fn new_client_id() -> ClientId {
    random_id()
}

/// A new random client group id.
pub fn new_client_group_id() -> ClientGroupId {
    random_id()
}

/// Builds the id sent along with a pull or push request.
pub fn new_request_id(client_id: &str, session: &str, counter: u64) -> String {
    format!("{client_id}-{session}-{counter}")
}
