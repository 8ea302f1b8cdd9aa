use serde::{Deserialize, Serialize};

use crate::value::{values_equal, Value};

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ArrayValue {
    values: Vec<Value>,
}

impl ArrayValue {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn contains(&self, needle: &Value) -> bool {
        self.values.iter().any(|value| values_equal(value, needle))
    }

    /// Appends every element that is not already present.
    pub fn union_with(&self, elements: &[Value]) -> Self {
        let mut values = self.values.clone();
        for element in elements {
            if !values.iter().any(|existing| values_equal(existing, element)) {
                values.push(element.clone());
            }
        }
        Self { values }
    }

    /// Drops every occurrence of each element.
    pub fn remove_all(&self, elements: &[Value]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|value| !elements.iter().any(|element| values_equal(value, element)))
            .cloned()
            .collect();
        Self { values }
    }
}
