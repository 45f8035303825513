use serde::{Deserialize, Serialize};

use crate::group::users::UserData;

/// A minimal [UserData] for tests: a user has a name, and an update may change it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockUser {
    pub name: String,
}

impl MockUser {
    pub fn new(name: &str) -> MockUser {
        MockUser {
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockUserUpdate {
    pub name: Option<String>,
}

impl MockUserUpdate {
    pub fn name(name: &str) -> MockUserUpdate {
        MockUserUpdate {
            name: Some(name.to_string()),
        }
    }
}

impl UserData for MockUser {
    type Update = MockUserUpdate;

    fn apply_update(&mut self, update: &MockUserUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
    }
}
