//! MD5 password hashing.

/// Hash a password for an `AuthenticationMD5Password` challenge.
///
/// The result is `"md5"` followed by `hex(md5(hex(md5(password ++ user)) ++ salt))`.
#[must_use]
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut inner = Vec::with_capacity(password.len() + user.len());
    inner.extend_from_slice(password.as_bytes());
    inner.extend_from_slice(user.as_bytes());
    let inner_hex = format!("{:x}", md5::compute(&inner));

    let mut outer = Vec::with_capacity(inner_hex.len() + salt.len());
    outer.extend_from_slice(inner_hex.as_bytes());
    outer.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(&outer))
}
