use std::fmt;

/// Register data type as written in the register description file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegisterType {
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    Bcd16,
    Ascii,
}

impl RegisterType {
    pub fn parse(name: &str) -> Option<RegisterType> {
        match name.trim().to_uppercase().as_str() {
            "U16" => Some(RegisterType::U16),
            "I16" => Some(RegisterType::I16),
            "U32" => Some(RegisterType::U32),
            "I32" => Some(RegisterType::I32),
            "U64" => Some(RegisterType::U64),
            "I64" => Some(RegisterType::I64),
            "BCD16" => Some(RegisterType::Bcd16),
            "ASCII" => Some(RegisterType::Ascii),
            _ => None,
        }
    }

    /// Number of consecutive registers a single value occupies.
    pub fn word_count(&self) -> u16 {
        match self {
            RegisterType::U32 | RegisterType::I32 => 2,
            RegisterType::U64 | RegisterType::I64 => 4,
            _ => 1,
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RegisterType::U16 => "U16",
            RegisterType::I16 => "I16",
            RegisterType::U32 => "U32",
            RegisterType::I32 => "I32",
            RegisterType::U64 => "U64",
            RegisterType::I64 => "I64",
            RegisterType::Bcd16 => "BCD16",
            RegisterType::Ascii => "ASCII",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(_) => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Value::Number(n) if *n == 0.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{:.4}", n),
            Value::Text(t) => write!(f, "\"{}\"", t),
        }
    }
}

fn compose(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, w| (acc << 16) | u64::from(*w))
}

/// Picks the words a multi-register value is built from, degrading to a
/// shorter composition when the block came back short.
fn take_words(words: &[u16], kind: RegisterType) -> &[u16] {
    let wanted = kind.word_count() as usize;
    if words.len() >= wanted {
        return &words[..wanted];
    }
    let fallback = if words.len() >= 2 { 2 } else { 1 };
    warn!(
        "{}: got {} of {} words, falling back to {}-bit composition",
        kind,
        words.len(),
        wanted,
        fallback * 16
    );
    &words[..fallback]
}

/// Decodes raw register words (most significant register first) into a
/// physical value. Never fails loudly: anything undecodable is `None`.
pub fn decode(words: &[u16], kind: RegisterType, accuracy: f64) -> Option<Value> {
    if words.is_empty() {
        return None;
    }
    let raw: f64 = match kind {
        RegisterType::U16 => words[0] as f64,
        RegisterType::I16 => words[0] as i16 as f64,
        RegisterType::U32 => compose(take_words(words, kind)) as f64,
        RegisterType::I32 => {
            let w = take_words(words, kind);
            if w.len() == 2 {
                compose(w) as u32 as i32 as f64
            } else {
                w[0] as f64
            }
        }
        RegisterType::U64 => compose(take_words(words, kind)) as f64,
        RegisterType::I64 => {
            let w = take_words(words, kind);
            if w.len() == 4 {
                compose(w) as i64 as f64
            } else {
                compose(w) as f64
            }
        }
        RegisterType::Bcd16 => {
            // each nibble is one decimal digit; a nibble above 9 is not BCD
            let digits = format!("{:04x}", words[0]);
            match digits.parse::<u32>() {
                Ok(v) => v as f64,
                Err(_) => {
                    warn!("BCD16: invalid digits in 0x{:04X}", words[0]);
                    return None;
                }
            }
        }
        RegisterType::Ascii => {
            let bytes: Vec<u8> = words.iter().fold(vec![], |mut x, elem| {
                if (elem >> 8) as u8 != 0 {
                    x.push((elem >> 8) as u8);
                }
                if (elem & 0xff) as u8 != 0 {
                    x.push((elem & 0xff) as u8);
                }
                x
            });
            let text: String = bytes.into_iter().map(char::from).collect();
            return Some(Value::Text(text.trim_end_matches('\0').to_string()));
        }
    };
    Some(Value::Number(raw * accuracy))
}

/// Same as [`decode`] but for a type still in its textual form.
pub fn decode_named(words: &[u16], kind: &str, accuracy: f64) -> Option<Value> {
    match RegisterType::parse(kind) {
        Some(k) => decode(words, k, accuracy),
        None => {
            warn!("Unknown register type: {:?}", kind);
            None
        }
    }
}
