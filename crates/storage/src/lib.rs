use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

use shared::domain::{
    CategoryName, CustomerId, CustomerSummary, FilmDetail, FilmWithActors, RecentRental,
};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Any failure reported by the store: lost connection, malformed statement or
/// a row that does not decode into the expected shape.
#[derive(Debug, Error)]
#[error("catalog query failed: {0}")]
pub struct QueryError(#[from] pub sqlx::Error);

/// Fixed read patterns over the catalog schema.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn fetch_top_films_with_actors(&self, limit: u32)
        -> Result<Vec<FilmWithActors>, QueryError>;
    async fn fetch_top_categories(&self, limit: u32) -> Result<Vec<CategoryName>, QueryError>;
    async fn fetch_top_films_with_description_and_actors(
        &self,
        limit: u32,
    ) -> Result<Vec<FilmDetail>, QueryError>;
    async fn fetch_top_customers(&self, limit: u32) -> Result<Vec<CustomerSummary>, QueryError>;
    /// Newest rentals first.
    async fn fetch_recent_rentals_for_customer(
        &self,
        customer_id: CustomerId,
        limit: u32,
    ) -> Result<Vec<RecentRental>, QueryError>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

// Actor names are concatenated per film by a correlated subquery; ordering by
// actor_id keeps the string stable across reads.
const FILMS_WITH_ACTORS_SQL: &str = "
    SELECT f.title, f.release_year,
           (SELECT GROUP_CONCAT(a.first_name || ' ' || a.last_name, ', ' ORDER BY a.actor_id)
              FROM film_actor fa
              JOIN actor a ON fa.actor_id = a.actor_id
             WHERE fa.film_id = f.film_id) AS actors
      FROM film f
     ORDER BY f.film_id
     LIMIT ?";

const FILMS_WITH_DESCRIPTION_SQL: &str = "
    SELECT f.title, f.release_year, f.description,
           (SELECT GROUP_CONCAT(a.first_name || ' ' || a.last_name, ', ' ORDER BY a.actor_id)
              FROM film_actor fa
              JOIN actor a ON fa.actor_id = a.actor_id
             WHERE fa.film_id = f.film_id) AS actors
      FROM film f
     ORDER BY f.film_id
     LIMIT ?";

const RECENT_RENTALS_SQL: &str = "
    SELECT f.title, r.rental_date
      FROM rental r
      JOIN inventory i ON r.inventory_id = i.inventory_id
      JOIN film f ON i.film_id = f.film_id
     WHERE r.customer_id = ?
     ORDER BY r.rental_date DESC, r.rental_id DESC
     LIMIT ?";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open catalog database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to apply catalog schema")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Runs a multi-statement SQL script as-is. Only the seeding tool and tests
    /// call this; page queries never write.
    pub async fn run_script(&self, sql: &str) -> Result<(), QueryError> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for Storage {
    async fn fetch_top_films_with_actors(
        &self,
        limit: u32,
    ) -> Result<Vec<FilmWithActors>, QueryError> {
        let rows = sqlx::query(FILMS_WITH_ACTORS_SQL)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let films = rows.iter().map(film_with_actors).collect::<Result<_, _>>()?;
        Ok(films)
    }

    async fn fetch_top_categories(&self, limit: u32) -> Result<Vec<CategoryName>, QueryError> {
        let rows = sqlx::query("SELECT name FROM category ORDER BY category_id LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let categories = rows.iter().map(category_name).collect::<Result<_, _>>()?;
        Ok(categories)
    }

    async fn fetch_top_films_with_description_and_actors(
        &self,
        limit: u32,
    ) -> Result<Vec<FilmDetail>, QueryError> {
        let rows = sqlx::query(FILMS_WITH_DESCRIPTION_SQL)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let films = rows.iter().map(film_detail).collect::<Result<_, _>>()?;
        Ok(films)
    }

    async fn fetch_top_customers(&self, limit: u32) -> Result<Vec<CustomerSummary>, QueryError> {
        let rows = sqlx::query(
            "SELECT customer_id, first_name, last_name
             FROM customer
             ORDER BY customer_id
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        let customers = rows
            .iter()
            .map(customer_summary)
            .collect::<Result<_, _>>()?;
        Ok(customers)
    }

    async fn fetch_recent_rentals_for_customer(
        &self,
        customer_id: CustomerId,
        limit: u32,
    ) -> Result<Vec<RecentRental>, QueryError> {
        let rows = sqlx::query(RECENT_RENTALS_SQL)
            .bind(customer_id.0)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let rentals = rows.iter().map(recent_rental).collect::<Result<_, _>>()?;
        Ok(rentals)
    }
}

fn film_with_actors(row: &SqliteRow) -> Result<FilmWithActors, sqlx::Error> {
    Ok(FilmWithActors {
        title: row.try_get("title")?,
        release_year: row.try_get("release_year")?,
        actors: actors_column(row)?,
    })
}

fn film_detail(row: &SqliteRow) -> Result<FilmDetail, sqlx::Error> {
    Ok(FilmDetail {
        title: row.try_get("title")?,
        release_year: row.try_get("release_year")?,
        description: row.try_get("description")?,
        actors: actors_column(row)?,
    })
}

// GROUP_CONCAT over zero rows yields NULL.
fn actors_column(row: &SqliteRow) -> Result<String, sqlx::Error> {
    Ok(row
        .try_get::<Option<String>, _>("actors")?
        .unwrap_or_default())
}

fn category_name(row: &SqliteRow) -> Result<CategoryName, sqlx::Error> {
    Ok(CategoryName {
        name: row.try_get("name")?,
    })
}

fn customer_summary(row: &SqliteRow) -> Result<CustomerSummary, sqlx::Error> {
    Ok(CustomerSummary {
        customer_id: CustomerId(row.try_get("customer_id")?),
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
    })
}

fn recent_rental(row: &SqliteRow) -> Result<RecentRental, sqlx::Error> {
    Ok(RecentRental {
        title: row.try_get("title")?,
        rental_date: rental_date_column(row)?,
    })
}

// Date-only values (`2024-03-01`) are read as midnight of that day.
fn rental_date_column(row: &SqliteRow) -> Result<NaiveDateTime, sqlx::Error> {
    row.try_get::<NaiveDateTime, _>("rental_date").or_else(|error| {
        row.try_get::<NaiveDate, _>("rental_date")
            .map(|date| date.and_time(NaiveTime::MIN))
            .map_err(|_| error)
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
