//! Collision naming for uploads
//!
//! When the destination already holds a different file at the same path,
//! the upload goes to the first free name of the form
//! `report (1).txt`, `report (2).txt`, ... Existing objects are never
//! overwritten.

/// Deterministic suffix naming
pub struct CollisionNamer;

impl CollisionNamer {
    /// `name` with ` (n)` inserted before the last extension
    ///
    /// A leading dot does not start an extension, so `.env` becomes `.env (1)`.
    pub fn numbered(name: &str, n: u32) -> String {
        match name.rfind('.') {
            Some(dot_pos) if dot_pos > 0 => {
                let (stem, ext) = name.split_at(dot_pos);
                format!("{stem} ({n}){ext}")
            }
            _ => format!("{name} ({n})"),
        }
    }

    /// First numbered variant of `name` for which `exists` is false
    pub fn generate_unique<F>(name: &str, mut exists: F) -> String
    where
        F: FnMut(&str) -> bool,
    {
        let mut n = 1;
        loop {
            let candidate = Self::numbered(name, n);
            if !exists(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}
