//! Walk the members of a JSON object without deserializing it.
//!
//! Store replies keyed by dynamic ids (query results, tag maps, the
//! fingerprint mailbox) cannot be described by a fixed struct. This scanner
//! yields each `(key, raw value)` pair; leaf values are then decoded with
//! `serde_json_core`.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JsonError;

/// Iterator over the top-level members of an object.
pub struct Members<'a> {
    src: &'a str,
    pos: usize,
    done: bool,
}

/// Start walking `doc`. `null` is treated as an empty object.
pub fn members(doc: &str) -> Result<Members<'_>, JsonError> {
    let trimmed = doc.trim();
    if trimmed == "null" {
        return Ok(Members {
            src: trimmed,
            pos: 0,
            done: true,
        });
    }
    if !trimmed.starts_with('{') {
        return Err(JsonError);
    }
    Ok(Members {
        src: trimmed,
        pos: 1,
        done: false,
    })
}

/// Decode a JSON string leaf that contains no escapes.
pub fn str_value(raw: &str) -> Option<&str> {
    serde_json_core::from_str::<&str>(raw).ok().map(|(s, _)| s)
}

impl<'a> Members<'a> {
    fn skip_ws(&mut self) {
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn next_member(&mut self) -> Result<Option<(&'a str, &'a str)>, JsonError> {
        let bytes = self.src.as_bytes();
        self.skip_ws();
        match bytes.get(self.pos) {
            Some(b'}') => return Ok(None),
            Some(b'"') => {}
            _ => return Err(JsonError),
        }

        let key_end = skip_string(bytes, self.pos)?;
        let key = &self.src[self.pos + 1..key_end - 1];
        self.pos = key_end;

        self.skip_ws();
        if bytes.get(self.pos) != Some(&b':') {
            return Err(JsonError);
        }
        self.pos += 1;
        self.skip_ws();

        let value_start = self.pos;
        let value_end = skip_value(bytes, value_start)?;
        let value = &self.src[value_start..value_end];
        self.pos = value_end;

        self.skip_ws();
        match bytes.get(self.pos) {
            Some(b',') => self.pos += 1,
            Some(b'}') => {}
            _ => return Err(JsonError),
        }
        Ok(Some((key, value)))
    }
}

impl<'a> Iterator for Members<'a> {
    type Item = Result<(&'a str, &'a str), JsonError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_member() {
            Ok(Some(member)) => Some(Ok(member)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Returns the index just past the closing quote of the string at `start`.
fn skip_string(bytes: &[u8], start: usize) -> Result<usize, JsonError> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(JsonError)
}

/// Returns the index just past the value starting at `start`.
fn skip_value(bytes: &[u8], start: usize) -> Result<usize, JsonError> {
    match bytes.get(start) {
        Some(b'"') => skip_string(bytes, start),
        Some(b'{') | Some(b'[') => {
            let mut depth = 0usize;
            let mut i = start;
            while i < bytes.len() {
                match bytes[i] {
                    b'"' => {
                        i = skip_string(bytes, i)?;
                        continue;
                    }
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(i + 1);
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
            Err(JsonError)
        }
        Some(_) => {
            // number, true, false, null
            let mut i = start;
            while i < bytes.len() && !matches!(bytes[i], b',' | b'}' | b']') {
                if bytes[i].is_ascii_whitespace() {
                    break;
                }
                i += 1;
            }
            if i == start {
                Err(JsonError)
            } else {
                Ok(i)
            }
        }
        None => Err(JsonError),
    }
}
