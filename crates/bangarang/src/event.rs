//! The event that flows through one pass of the pipeline, its tag set, and
//! the binary wire encoding used by the TCP provider's alternative codec.

use crate::errors::{Error, Result};

/// Tag key reserved for liveness heartbeats. The tracker counts events with
/// this service name but the pipeline never escalates on them.
pub const KEEP_ALIVE_SERVICE: &str = "KeepAlive";

/// A metric's verdict under one policy's condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Warning = 1,
    Critical = 2,
}

impl Status {
    /// Lowercase name, matching the original's `Status(code int) string`.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Warning => "warning",
            Status::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered (key, value) tag list. Keys are unique within a set; inserting
/// an existing key overwrites its value in place rather than appending.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TagSet(Vec<(String, String)>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, preserving the key's original insertion
    /// position if it already existed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    /// Look up a tag's value, or `""` if absent -- matching the original's
    /// `Get` semantics of never returning an error for a missing key.
    pub fn get(&self, key: &str) -> &str {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical string form, keys in insertion order, used as the input to
    /// incident identity hashing. Stable for equal tag sets regardless of
    /// how they were built up.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.0 {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push(';');
        }
        out
    }
}

/// A single metric observation. Lives for one pass through the pipeline;
/// the core never retains an `Event` after dispatch completes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Event {
    pub metric: f64,
    pub tags: TagSet,
    pub time: i64,
    pub status: Status,
}

impl Event {
    pub fn new(metric: f64, tags: TagSet) -> Self {
        Event {
            metric,
            tags,
            time: now_unix(),
            status: Status::Ok,
        }
    }

    pub fn host(&self) -> &str {
        self.tags.get("host")
    }

    pub fn service(&self) -> &str {
        self.tags.get("service")
    }

    pub fn sub_service(&self) -> &str {
        self.tags.get("sub_service")
    }

    /// `host + service + sub_service`: the group key used both as the
    /// policy's default grouping partition and as the `EventTracker`
    /// lookup key (see `Condition`).
    pub fn index_name(&self) -> String {
        format!("{}{}{}", self.host(), self.service(), self.sub_service())
    }

    pub fn is_keep_alive(&self) -> bool {
        self.service() == KEEP_ALIVE_SERVICE
    }

    /// Encode as `[8B size][8B metric][tag entries...]`, each tag's key and
    /// value length-prefixed by one byte and silently truncated to 256
    /// bytes if longer -- matching `sizeOfString`'s `min(len, 256)` exactly,
    /// wrapped-to-zero length prefix included. A field of exactly 256 bytes
    /// therefore round-trips as an empty string on decode; this is the
    /// original's behavior, preserved rather than patched.
    pub fn encode_binary(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (k, v) in self.tags.iter() {
            push_capped_string(&mut body, k);
            push_capped_string(&mut body, v);
        }

        let total_len = 16 + body.len();
        let mut buf = Vec::with_capacity(total_len);
        buf.extend_from_slice(&(total_len as u64).to_be_bytes());
        buf.extend_from_slice(&self.metric.to_bits().to_be_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    /// Decode the format produced by [`Event::encode_binary`].
    pub fn decode_binary(buf: &[u8]) -> Result<Event> {
        if buf.len() < 16 {
            return Err(Error::ProviderProtocol(format!(
                "binary event too short: {} bytes",
                buf.len()
            )));
        }

        let declared_len = u64::from_be_bytes(buf[0..8].try_into().unwrap_or([0; 8])) as usize;
        if declared_len != buf.len() {
            return Err(Error::ProviderProtocol(format!(
                "binary event size mismatch: header says {declared_len}, got {}",
                buf.len()
            )));
        }

        let metric = f64::from_bits(u64::from_be_bytes(buf[8..16].try_into().unwrap_or([0; 8])));

        let mut tags = TagSet::new();
        let mut offset = 16;
        while offset < buf.len() {
            let (key, next) = read_capped_string(buf, offset)?;
            let (value, next) = read_capped_string(buf, next)?;
            tags.set(key, value);
            offset = next;
        }

        Ok(Event::new(metric, tags))
    }
}

fn push_capped_string(buf: &mut Vec<u8>, s: &str) {
    let capped: &str = if s.len() > 256 {
        let mut end = 256;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    } else {
        s
    };
    // Matches the original's `uint8(tmp)`: a capped length of exactly 256
    // wraps to 0 here, same as there.
    buf.push(capped.len() as u8);
    buf.extend_from_slice(capped.as_bytes());
}

fn read_capped_string(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let len = *buf
        .get(offset)
        .ok_or_else(|| Error::ProviderProtocol("truncated tag length prefix".into()))?
        as usize;
    let start = offset + 1;
    let end = start + len;
    let slice = buf
        .get(start..end)
        .ok_or_else(|| Error::ProviderProtocol("truncated tag payload".into()))?;
    let s = String::from_utf8(slice.to_vec())
        .map_err(|e| Error::ProviderProtocol(format!("non-utf8 tag: {e}")))?;
    Ok((s, end))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
