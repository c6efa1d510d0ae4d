use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(CustomerId);

/// A film with its linked actors folded into one display string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmWithActors {
    pub title: String,
    pub release_year: Option<i32>,
    /// `"First Last"` names joined with `", "`; empty when no actor is linked.
    pub actors: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmDetail {
    pub title: String,
    pub release_year: Option<i32>,
    pub description: Option<String>,
    pub actors: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryName {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSummary {
    pub customer_id: CustomerId,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentRental {
    pub title: String,
    pub rental_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerWithRentals {
    #[serde(flatten)]
    pub customer: CustomerSummary,
    pub rentals: Vec<RecentRental>,
}
