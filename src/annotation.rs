use std::fmt;

/// Flags attached to a path or command argument. They survive every string
/// transform the engine performs (format, glob expansion, extraction).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Annotations {
    /// Absence is not an error; dependents observe it through the filesystem.
    pub optional: bool,
    /// Only existence matters; modification times are ignored.
    pub exists: bool,
    /// Never deleted by stale/failed output scrubbing.
    pub precious: bool,
    /// Not a file; always rebuilt, with a synthetic modification time.
    pub phony: bool,
    /// Highlighted in log output.
    pub emphasized: bool,
}

impl Annotations {
    pub fn is_empty(&self) -> bool {
        *self == Annotations::default()
    }
}

/// A string value paired with its annotation set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Annotated {
    value: String,
    annotations: Annotations,
}

impl Annotated {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            annotations: Annotations::default(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn annotations(&self) -> Annotations {
        self.annotations
    }

    /// A new value carrying this value's annotations.
    pub fn derive(&self, value: impl Into<String>) -> Annotated {
        Annotated {
            value: value.into(),
            annotations: self.annotations,
        }
    }

    pub(crate) fn with_annotations(value: impl Into<String>, annotations: Annotations) -> Self {
        Self {
            value: value.into(),
            annotations,
        }
    }

    pub fn is_optional(&self) -> bool {
        self.annotations.optional
    }

    pub fn is_exists_only(&self) -> bool {
        self.annotations.exists
    }

    pub fn is_precious(&self) -> bool {
        self.annotations.precious
    }

    pub fn is_phony(&self) -> bool {
        self.annotations.phony
    }

    pub fn is_emphasized(&self) -> bool {
        self.annotations.emphasized
    }
}

impl fmt::Display for Annotated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl AsRef<str> for Annotated {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl From<&str> for Annotated {
    fn from(value: &str) -> Self {
        Annotated::new(value)
    }
}

impl From<String> for Annotated {
    fn from(value: String) -> Self {
        Annotated::new(value)
    }
}

impl From<&String> for Annotated {
    fn from(value: &String) -> Self {
        Annotated::new(value.clone())
    }
}

impl From<&Annotated> for Annotated {
    fn from(value: &Annotated) -> Self {
        value.clone()
    }
}

pub fn optional(value: impl Into<Annotated>) -> Annotated {
    let mut a = value.into();
    a.annotations.optional = true;
    a
}

pub fn exists(value: impl Into<Annotated>) -> Annotated {
    let mut a = value.into();
    a.annotations.exists = true;
    a
}

pub fn precious(value: impl Into<Annotated>) -> Annotated {
    let mut a = value.into();
    a.annotations.precious = true;
    a
}

pub fn phony(value: impl Into<Annotated>) -> Annotated {
    let mut a = value.into();
    a.annotations.phony = true;
    a
}

pub fn emphasized(value: impl Into<Annotated>) -> Annotated {
    let mut a = value.into();
    a.annotations.emphasized = true;
    a
}
