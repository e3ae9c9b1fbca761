//! Messages of the `greet` package, generated from `proto/greet.proto`.

include!(concat!(env!("OUT_DIR"), "/greet.rs"));

impl Greeting {
    /// A greeting for `first_name` with no last name.
    pub fn first(first_name: impl Into<String>) -> Self {
        Greeting {
            first_name: first_name.into(),
            last_name: String::new(),
        }
    }

    /// A greeting for `first_name last_name`.
    pub fn full(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Greeting {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    /// The non-empty name parts joined by a single space.
    pub fn full_name(&self) -> String {
        [self.first_name.as_str(), self.last_name.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<Greeting> for GreetRequest {
    fn from(greeting: Greeting) -> Self {
        GreetRequest {
            greeting: Some(greeting),
        }
    }
}

impl From<i32> for Numbers {
    fn from(number: i32) -> Self {
        Numbers { number }
    }
}
