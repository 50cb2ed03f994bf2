/// One header line. `name` is stored lowercased; `value` is stored trimmed
/// but otherwise exactly as received, so responses can echo it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered multimap of SIP headers keyed by lowercase ASCII name.
///
/// Duplicate names are retained in append order; lookup is case-insensitive.
/// This replaces a general-purpose insertion-order map: constructed messages
/// simply push headers in the order they should serialize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.0.push(Header {
            name: name.to_ascii_lowercase(),
            value: value.into(),
        });
    }

    /// First value under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    /// All values under `name`, in append order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .filter(|h| h.name == name)
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Replace every occurrence of `name` with a single value, keeping the
    /// position of the first occurrence; appends if the name is absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let lname = name.to_ascii_lowercase();
        let value = value.into();
        match self.0.iter().position(|h| h.name == lname) {
            Some(first) => {
                self.0[first].value = value;
                let mut index = first + 1;
                while index < self.0.len() {
                    if self.0[index].name == lname {
                        self.0.remove(index);
                    } else {
                        index += 1;
                    }
                }
            }
            None => self.push(&lname, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.0.retain(|h| h.name != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Wire casing for a stored lowercase name: known irregular names first,
/// otherwise each dash-separated segment is title-cased.
pub fn canonical_name(name: &str) -> String {
    match name {
        "call-id" => return "Call-ID".to_string(),
        "cseq" => return "CSeq".to_string(),
        "www-authenticate" => return "WWW-Authenticate".to_string(),
        _ => {}
    }
    let mut out = String::with_capacity(name.len());
    for (i, segment) in name.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    out
}
