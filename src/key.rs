//! Cache key generation
//!
//! Derives a stable string key from a function identity, its arguments and an
//! optional prefix. Keys are deterministic across process restarts: they never
//! depend on memory addresses or hash-seed randomness, and two distinct
//! instances that resolve to the same per-argument representation produce the
//! same key.

use crate::error::{CacheError, Result};
use sha2::{Digest, Sha256};

/// Per-argument key derivation via ordered capability probing.
///
/// Resolution order, first match wins:
/// 1. [`custom_key`](KeyPart::custom_key)
/// 2. [`pk`](KeyPart::pk) rendered as `"<TypeName>::<pk>"`
/// 3. [`id`](KeyPart::id) rendered as `"<TypeName>::<id>"`
/// 4. [`render`](KeyPart::render) fallback
///
/// Entity-style types implement `pk` or `id` so that reloaded instances of the
/// same record map to the same key regardless of object identity.
pub trait KeyPart {
    /// Fully custom key representation, bypassing all other probes.
    fn custom_key(&self) -> Option<String> {
        None
    }

    /// Primary-key style identifier.
    fn pk(&self) -> Option<String> {
        None
    }

    /// Plain identifier.
    fn id(&self) -> Option<String> {
        None
    }

    /// Fallback string rendering; must be stable for equal values.
    fn render(&self) -> String;

    /// Resolve the final key representation for this argument.
    fn key_repr(&self) -> String
    where
        Self: Sized,
    {
        if let Some(key) = self.custom_key() {
            return key;
        }
        let type_name = short_type_name(std::any::type_name::<Self>());
        if let Some(pk) = self.pk() {
            return format!("{}::{}", type_name, pk);
        }
        if let Some(id) = self.id() {
            return format!("{}::{}", type_name, id);
        }
        self.render()
    }
}

fn short_type_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}

macro_rules! impl_key_part_via_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KeyPart for $ty {
                fn render(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_key_part_via_display!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, String,
    uuid::Uuid,
);

impl KeyPart for &str {
    fn render(&self) -> String {
        (*self).to_string()
    }
}

impl<T: KeyPart> KeyPart for &T {
    fn custom_key(&self) -> Option<String> {
        (*self).custom_key()
    }

    fn pk(&self) -> Option<String> {
        (*self).pk()
    }

    fn id(&self) -> Option<String> {
        (*self).id()
    }

    fn render(&self) -> String {
        (*self).render()
    }
}

impl<T: KeyPart> KeyPart for Option<T> {
    fn render(&self) -> String {
        match self {
            Some(inner) => inner.key_repr(),
            None => "None".to_string(),
        }
    }
}

impl<T: KeyPart> KeyPart for Vec<T> {
    fn render(&self) -> String {
        let parts: Vec<String> = self.iter().map(|p| p.key_repr()).collect();
        format!("[{}]", parts.join(","))
    }
}

/// Accumulated argument representations for one call.
///
/// Positional arguments keep their order; keyword arguments are name-sorted
/// when the key is composed.
#[derive(Debug, Clone, Default)]
pub struct KeySpec {
    args: Vec<String>,
    kwargs: Vec<(String, String)>,
}

impl KeySpec {
    /// Create an empty argument spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a positional argument.
    pub fn arg(mut self, part: &impl KeyPart) -> Self {
        self.args.push(part.key_repr());
        self
    }

    /// Add a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, part: &impl KeyPart) -> Self {
        self.kwargs.push((name.into(), part.key_repr()));
        self
    }

    /// Resolved positional representations.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Resolved named representations, in insertion order.
    pub fn kwargs(&self) -> &[(String, String)] {
        &self.kwargs
    }

    fn composed(&self) -> String {
        let mut parts: Vec<String> = self.args.clone();
        let mut kwargs = self.kwargs.clone();
        kwargs.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in kwargs {
            parts.push(format!("{}={}", name, value));
        }
        parts.join(",")
    }
}

/// Generate a cache key for a function invocation.
///
/// The key is the hex sha256 digest of
/// `"{prefix}:{function}({args},{name=value,...})"`, which keeps keys a fixed
/// length and free of characters a backend might treat specially.
pub fn generate(function: &str, prefix: Option<&str>, spec: &KeySpec) -> Result<String> {
    if function.is_empty() {
        return Err(CacheError::KeyGeneration(
            "function identity must not be empty".to_string(),
        ));
    }

    let body = format!("{}({})", function, spec.composed());
    let full = match prefix {
        Some(p) => format!("{}:{}", p, body),
        None => body,
    };

    let mut hasher = Sha256::new();
    hasher.update(full.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
