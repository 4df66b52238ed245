use std::{fmt, ops::Index, sync::Arc};

use serde::{
    de::{Deserialize, Deserializer, MapAccess, Visitor},
    ser::{Serialize, SerializeMap, Serializer},
};

/// The reserved label name carrying the metric name.
pub const METRIC_NAME: &str = "__name__";

/// Label is a key/value pair of strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// `Labels` is a sorted set of `Label`s.
///
/// Labels with an empty value are never stored: an empty value and an absent
/// label are the same thing.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Vec<Arc<Label>>);

impl Labels {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        let mut labels = labels
            .into_iter()
            .filter(|(_, v)| !v.as_ref().is_empty())
            .map(|(k, v)| {
                Arc::new(Label {
                    name: k.as_ref().to_owned(),
                    value: v.as_ref().to_owned(),
                })
            })
            .collect::<Vec<_>>();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        assert!(
            !labels.windows(2).any(|w| w[0].name == w[1].name),
            "label names are not unique"
        );
        Self(labels)
    }

    /// Returns the value of the label with given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by_key(&name, |label| label.name.as_str())
            .ok()
            .map(|index| self.0[index].value.as_str())
    }

    /// Returns the metric name, if any.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter().map(|label| label.as_ref())
    }

    /// Retains only the labels specified by the predicate.
    pub fn retain<P>(&mut self, mut predicate: P)
    where
        P: FnMut(&Label) -> bool,
    {
        self.0.retain(|label| predicate(label.as_ref()))
    }

    /// Returns a copy of the label set with all labels named in `names`
    /// removed. Names that are not present are ignored.
    pub fn without<S: AsRef<str>>(&self, names: &[S]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|label| !names.iter().any(|n| n.as_ref() == label.name))
                .cloned()
                .collect(),
        )
    }

    /// Same as [`Labels::without`] for the metric name only.
    pub fn without_metric_name(&self) -> Labels {
        self.without(&[METRIC_NAME])
    }

    pub fn signature(&self) -> Signature {
        self.signature_without_labels(&[])
    }

    /// `signature_without_labels` is just as `signature`, but only for labels
    /// not matching `names`
    pub fn signature_without_labels(&self, exclude_names: &[&str]) -> Signature {
        let mut hasher = blake3::Hasher::new();
        self.0
            .iter()
            .filter(|label| !exclude_names.contains(&label.name.as_str()))
            .for_each(|label| {
                hasher.update(label.name.as_bytes());
                hasher.update(&[0xff]);
                hasher.update(label.value.as_bytes());
                hasher.update(&[0xff]);
            });
        Signature(hasher.finalize().into())
    }
}

impl Index<&str> for Labels {
    type Output = str;

    fn index(&self, key: &str) -> &Self::Output {
        match self.get(key) {
            Some(value) => value,
            None => panic!("no label found for key {key:?}"),
        }
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        f.write_str("}")
    }
}

impl Serialize for Labels {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in &self.0 {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Labels {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LabelsVisitor;

        impl<'de> Visitor<'de> for LabelsVisitor {
            type Value = Labels;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of label names to label values")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut pairs: Vec<(String, String)> = Vec::new();
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    if pairs.iter().any(|(n, _)| *n == name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate label name {name:?}"
                        )));
                    }
                    pairs.push((name, value));
                }
                Ok(Labels::new(pairs))
            }
        }

        deserializer.deserialize_map(LabelsVisitor)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Signature([u8; 32]);

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        hex::encode(sig.0)
    }
}
