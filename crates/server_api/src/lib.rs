//! Turns catalog row sets into the view models each page renders.

use std::str::FromStr;

use futures::future::{join_all, try_join_all};
use shared::{
    domain::{CustomerSummary, CustomerWithRentals},
    view::{CustomerListingPage, LandingPage, MovieListingPage, SiteMetadata},
};
use storage::{CatalogStore, QueryError, Storage};
use thiserror::Error;
use tracing::{debug, warn};

pub const LANDING_FILM_LIMIT: u32 = 5;
pub const LANDING_CATEGORY_LIMIT: u32 = 5;
pub const LISTING_FILM_LIMIT: u32 = 15;
pub const CUSTOMER_LIMIT: u32 = 25;
pub const RENTALS_PER_CUSTOMER: u32 = 5;

pub const LANDING_TITLE: &str = "Home";
pub const MOVIES_TITLE: &str = "Movies";
pub const CUSTOMERS_TITLE: &str = "Customers";

/// What the customer listing does when one customer's rental lookup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RentalFailurePolicy {
    /// The whole listing fails.
    #[default]
    FailPage,
    /// The failure is logged and that customer is shown without rentals.
    EmptyRentals,
}

#[derive(Debug, Error)]
#[error("unknown rental failure policy '{0}' (expected 'fail_page' or 'empty_rentals')")]
pub struct UnknownPolicy(pub String);

impl FromStr for RentalFailurePolicy {
    type Err = UnknownPolicy;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fail_page" => Ok(Self::FailPage),
            "empty_rentals" => Ok(Self::EmptyRentals),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct ApiContext<S = Storage> {
    pub storage: S,
    pub site: SiteMetadata,
    pub rental_failure_policy: RentalFailurePolicy,
}

impl<S> ApiContext<S> {
    pub fn new(storage: S, site: SiteMetadata) -> Self {
        Self {
            storage,
            site,
            rental_failure_policy: RentalFailurePolicy::default(),
        }
    }

    pub fn with_rental_failure_policy(mut self, policy: RentalFailurePolicy) -> Self {
        self.rental_failure_policy = policy;
        self
    }
}

pub async fn assemble_landing<S: CatalogStore>(
    ctx: &ApiContext<S>,
) -> Result<LandingPage, QueryError> {
    let (movies, categories) = futures::try_join!(
        ctx.storage.fetch_top_films_with_actors(LANDING_FILM_LIMIT),
        ctx.storage.fetch_top_categories(LANDING_CATEGORY_LIMIT)
    )?;
    debug!(
        movies = movies.len(),
        categories = categories.len(),
        "assembled landing page"
    );

    Ok(LandingPage {
        site: ctx.site.clone(),
        page_title: LANDING_TITLE.to_string(),
        movies,
        categories,
    })
}

pub async fn assemble_movie_listing<S: CatalogStore>(
    ctx: &ApiContext<S>,
) -> Result<MovieListingPage, QueryError> {
    let movies = ctx
        .storage
        .fetch_top_films_with_description_and_actors(LISTING_FILM_LIMIT)
        .await?;
    debug!(movies = movies.len(), "assembled movie listing");

    Ok(MovieListingPage {
        site: ctx.site.clone(),
        page_title: MOVIES_TITLE.to_string(),
        movies,
    })
}

pub async fn assemble_customer_listing<S: CatalogStore>(
    ctx: &ApiContext<S>,
) -> Result<CustomerListingPage, QueryError> {
    let customers = ctx.storage.fetch_top_customers(CUSTOMER_LIMIT).await?;
    let customers = attach_recent_rentals(ctx, customers).await?;
    debug!(customers = customers.len(), "assembled customer listing");

    Ok(CustomerListingPage {
        site: ctx.site.clone(),
        page_title: CUSTOMERS_TITLE.to_string(),
        customers,
    })
}

/// Looks up every customer's rentals concurrently. Results are paired with
/// customers by position, never by completion order.
async fn attach_recent_rentals<S: CatalogStore>(
    ctx: &ApiContext<S>,
    customers: Vec<CustomerSummary>,
) -> Result<Vec<CustomerWithRentals>, QueryError> {
    let lookups = customers.iter().map(|customer| {
        ctx.storage
            .fetch_recent_rentals_for_customer(customer.customer_id, RENTALS_PER_CUSTOMER)
    });

    match ctx.rental_failure_policy {
        RentalFailurePolicy::FailPage => {
            let rentals = try_join_all(lookups).await?;
            Ok(customers
                .into_iter()
                .zip(rentals)
                .map(|(customer, rentals)| CustomerWithRentals { customer, rentals })
                .collect())
        }
        RentalFailurePolicy::EmptyRentals => {
            let results = join_all(lookups).await;
            Ok(customers
                .into_iter()
                .zip(results)
                .map(|(customer, result)| {
                    let rentals = result.unwrap_or_else(|error| {
                        warn!(
                            customer_id = customer.customer_id.0,
                            %error,
                            "rental lookup failed; showing customer without rentals"
                        );
                        Vec::new()
                    });
                    CustomerWithRentals { customer, rentals }
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::{HashMap, HashSet},
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use shared::domain::{CategoryName, CustomerId, FilmDetail, FilmWithActors, RecentRental};

    /// In-memory store whose rental lookups finish in reverse customer order.
    #[derive(Default)]
    struct ScriptedStore {
        customers: Vec<CustomerSummary>,
        rentals: HashMap<i64, Vec<RecentRental>>,
        failing_customers: HashSet<i64>,
        fail_customers_query: bool,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        rental_calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn with_customers(count: i64) -> Self {
            let customers = (1..=count)
                .map(|id| CustomerSummary {
                    customer_id: CustomerId(id),
                    first_name: format!("First{id}"),
                    last_name: format!("Last{id}"),
                })
                .collect();
            let rentals = (1..=count)
                .map(|id| {
                    (
                        id,
                        vec![RecentRental {
                            title: format!("Film{id}"),
                            rental_date: NaiveDate::from_ymd_opt(2024, 1, 1)
                                .expect("date")
                                .and_hms_opt(0, 0, 0)
                                .expect("time"),
                        }],
                    )
                })
                .collect();
            Self {
                customers,
                rentals,
                ..Self::default()
            }
        }
    }

    fn query_error() -> QueryError {
        QueryError(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl CatalogStore for ScriptedStore {
        async fn fetch_top_films_with_actors(
            &self,
            limit: u32,
        ) -> Result<Vec<FilmWithActors>, QueryError> {
            Ok((0..limit.min(7))
                .map(|i| FilmWithActors {
                    title: format!("Film{i}"),
                    release_year: Some(2006),
                    actors: "Ana Lee, Bo Tran".into(),
                })
                .collect())
        }

        async fn fetch_top_categories(&self, limit: u32) -> Result<Vec<CategoryName>, QueryError> {
            Ok((0..limit.min(3))
                .map(|i| CategoryName {
                    name: format!("Category{i}"),
                })
                .collect())
        }

        async fn fetch_top_films_with_description_and_actors(
            &self,
            limit: u32,
        ) -> Result<Vec<FilmDetail>, QueryError> {
            Ok((0..limit.min(20))
                .map(|i| FilmDetail {
                    title: format!("Film{i}"),
                    release_year: None,
                    description: Some("desc".into()),
                    actors: String::new(),
                })
                .collect())
        }

        async fn fetch_top_customers(
            &self,
            limit: u32,
        ) -> Result<Vec<CustomerSummary>, QueryError> {
            if self.fail_customers_query {
                return Err(query_error());
            }
            Ok(self
                .customers
                .iter()
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn fetch_recent_rentals_for_customer(
            &self,
            customer_id: CustomerId,
            limit: u32,
        ) -> Result<Vec<RecentRental>, QueryError> {
            self.rental_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let remaining = (self.customers.len() as i64 - customer_id.0).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(5 * remaining)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing_customers.contains(&customer_id.0) {
                return Err(query_error());
            }
            Ok(self
                .rentals
                .get(&customer_id.0)
                .map(|rentals| rentals.iter().take(limit as usize).cloned().collect())
                .unwrap_or_default())
        }
    }

    fn site() -> SiteMetadata {
        SiteMetadata::from_json(r#"{"site_title": "Catalog"}"#).expect("metadata")
    }

    #[tokio::test]
    async fn landing_page_uses_fixed_limits_and_metadata() {
        let ctx = ApiContext::new(ScriptedStore::default(), site());
        let page = assemble_landing(&ctx).await.expect("landing");

        assert_eq!(page.movies.len(), 5);
        assert_eq!(page.categories.len(), 3);
        assert_eq!(page.page_title, "Home");
        assert_eq!(
            page.site.get("site_title"),
            Some(&serde_json::json!("Catalog"))
        );
    }

    #[tokio::test]
    async fn movie_listing_caps_at_fifteen() {
        let ctx = ApiContext::new(ScriptedStore::default(), site());
        let page = assemble_movie_listing(&ctx).await.expect("listing");
        assert_eq!(page.movies.len(), 15);
        assert_eq!(page.page_title, "Movies");
    }

    #[tokio::test]
    async fn customer_order_survives_out_of_order_completion() {
        let ctx = ApiContext::new(ScriptedStore::with_customers(30), site());
        let page = assemble_customer_listing(&ctx).await.expect("customers");

        assert_eq!(page.customers.len(), 25);
        for (index, entry) in page.customers.iter().enumerate() {
            let id = index as i64 + 1;
            assert_eq!(entry.customer.customer_id, CustomerId(id));
            assert_eq!(entry.rentals.len(), 1);
            assert_eq!(entry.rentals[0].title, format!("Film{id}"));
        }
    }

    #[tokio::test]
    async fn rental_lookups_run_concurrently() {
        let ctx = ApiContext::new(ScriptedStore::with_customers(4), site());
        assemble_customer_listing(&ctx).await.expect("customers");

        assert_eq!(ctx.storage.rental_calls.load(Ordering::SeqCst), 4);
        assert!(ctx.storage.peak_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn one_failed_rental_lookup_fails_the_page_by_default() {
        let mut store = ScriptedStore::with_customers(3);
        store.failing_customers.insert(2);
        let ctx = ApiContext::new(store, site());

        assert!(assemble_customer_listing(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn empty_rentals_policy_keeps_the_page() {
        let mut store = ScriptedStore::with_customers(3);
        store.failing_customers.insert(2);
        let ctx = ApiContext::new(store, site())
            .with_rental_failure_policy(RentalFailurePolicy::EmptyRentals);

        let page = assemble_customer_listing(&ctx).await.expect("customers");
        let counts: Vec<usize> = page.customers.iter().map(|c| c.rentals.len()).collect();
        assert_eq!(counts, vec![1, 0, 1]);
    }

    #[tokio::test]
    async fn customer_query_failure_fails_under_any_policy() {
        let store = ScriptedStore {
            fail_customers_query: true,
            ..ScriptedStore::with_customers(2)
        };
        let ctx = ApiContext::new(store, site())
            .with_rental_failure_policy(RentalFailurePolicy::EmptyRentals);

        assert!(assemble_customer_listing(&ctx).await.is_err());
        assert_eq!(ctx.storage.rental_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_customers_means_no_rental_lookups() {
        let ctx = ApiContext::new(ScriptedStore::default(), site());
        let page = assemble_customer_listing(&ctx).await.expect("customers");
        assert!(page.customers.is_empty());
        assert_eq!(ctx.storage.rental_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pages_from_sqlite_store_are_repeatable() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        storage
            .run_script(
                "INSERT INTO film (film_id, title) VALUES (1, 'A'), (2, 'B');
                 INSERT INTO inventory (inventory_id, film_id) VALUES (1, 1), (2, 2);
                 INSERT INTO customer (customer_id, first_name, last_name) VALUES
                     (1, 'Ana', 'Lee'), (2, 'Bo', 'Tran');
                 INSERT INTO rental (rental_date, inventory_id, customer_id) VALUES
                     ('2024-01-01 00:00:00', 1, 2),
                     ('2024-02-01 00:00:00', 2, 2);",
            )
            .await
            .expect("seed");
        let ctx = ApiContext::new(storage, site());

        let first = assemble_customer_listing(&ctx).await.expect("first");
        let second = assemble_customer_listing(&ctx).await.expect("second");
        assert_eq!(first.customers, second.customers);
        assert!(first.customers[0].rentals.is_empty());
        let titles: Vec<&str> = first.customers[1]
            .rentals
            .iter()
            .map(|r| r.title.as_str())
            .collect();
        assert_eq!(titles, vec!["B", "A"]);
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!(
            "fail_page".parse::<RentalFailurePolicy>().expect("policy"),
            RentalFailurePolicy::FailPage
        );
        assert_eq!(
            " Empty_Rentals ".parse::<RentalFailurePolicy>().expect("policy"),
            RentalFailurePolicy::EmptyRentals
        );
        assert!("retry".parse::<RentalFailurePolicy>().is_err());
    }
}
