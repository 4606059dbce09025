#![forbid(unsafe_code)]

use std::time::Duration;

use agora_domain::{ChatMessage, MessageDraft, ValidationError};
use chrono::DateTime;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("invalid message: {0}")]
	Validation(#[from] ValidationError),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration failed: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("unsupported database_url (use sqlite:, postgres:, mysql:): {0}")]
	UnsupportedUrl(String),

	#[error("stored timestamp out of range: {0}")]
	InvalidTimestamp(i64),
}

/// Durable chat log. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct MessageStore {
	backend: StoreBackend,
}

#[derive(Clone)]
enum StoreBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

type MessageRow = (i64, i64, String, String, i64);

fn row_to_message(row: MessageRow) -> Result<ChatMessage, StoreError> {
	let (id, author_subject_id, author_name, body, created_at_ms) = row;
	let created_at =
		DateTime::from_timestamp_millis(created_at_ms).ok_or(StoreError::InvalidTimestamp(created_at_ms))?;
	Ok(ChatMessage {
		id,
		author_subject_id,
		author_name,
		body,
		created_at,
	})
}

fn horizon_ms(horizon: Duration) -> i64 {
	i64::try_from(horizon.as_millis()).unwrap_or(i64::MAX)
}

impl MessageStore {
	/// Open a pool for `database_url` and run the bundled migrations.
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		let backend = if database_url.starts_with("sqlite:") {
			let mut opts = SqlitePoolOptions::new();
			if database_url.contains(":memory:") {
				// Every pooled connection would otherwise get its own empty database.
				opts = opts.max_connections(1).idle_timeout(None).max_lifetime(None);
			}
			let pool = opts.connect(database_url).await?;
			sqlx::migrate!("migrations/sqlite").run(&pool).await?;
			StoreBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new().connect(database_url).await?;
			sqlx::migrate!("migrations/postgres").run(&pool).await?;
			StoreBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = MySqlPoolOptions::new().connect(database_url).await?;
			sqlx::migrate!("migrations/mysql").run(&pool).await?;
			StoreBackend::Mysql(pool)
		} else {
			let scheme = database_url.split(':').next().unwrap_or_default();
			return Err(StoreError::UnsupportedUrl(scheme.to_string()));
		};

		let store = Self { backend };
		info!(backend = store.backend_name(), "message store ready");
		Ok(store)
	}

	pub fn backend_name(&self) -> &'static str {
		match &self.backend {
			StoreBackend::Sqlite(_) => "sqlite",
			StoreBackend::Postgres(_) => "postgres",
			StoreBackend::Mysql(_) => "mysql",
		}
	}

	/// Close the pool. Later calls fail with a database error.
	pub async fn close(&self) {
		match &self.backend {
			StoreBackend::Sqlite(pool) => pool.close().await,
			StoreBackend::Postgres(pool) => pool.close().await,
			StoreBackend::Mysql(pool) => pool.close().await,
		}
	}

	/// Persist a message; id and `created_at` come from the database.
	pub async fn insert(&self, draft: &MessageDraft) -> Result<ChatMessage, StoreError> {
		draft.validate()?;

		let row: MessageRow = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as(
					"INSERT INTO chat_messages (author_subject_id, author_name, body, created_at_ms) \
					VALUES (?, ?, ?, CAST(strftime('%s','now') AS INTEGER) * 1000 + CAST(substr(strftime('%f','now'), 4, 3) AS INTEGER)) \
					RETURNING id, author_subject_id, author_name, body, created_at_ms",
				)
				.bind(draft.author_subject_id)
				.bind(&draft.author_name)
				.bind(&draft.body)
				.fetch_one(pool)
				.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as(
					"INSERT INTO chat_messages (author_subject_id, author_name, body, created_at_ms) \
					VALUES ($1, $2, $3, (EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT) \
					RETURNING id, author_subject_id, author_name, body, created_at_ms",
				)
				.bind(draft.author_subject_id)
				.bind(&draft.author_name)
				.bind(&draft.body)
				.fetch_one(pool)
				.await?
			}
			StoreBackend::Mysql(pool) => {
				let res = sqlx::query(
					"INSERT INTO chat_messages (author_subject_id, author_name, body, created_at_ms) \
					VALUES (?, ?, ?, CAST(UNIX_TIMESTAMP(NOW(3)) * 1000 AS SIGNED))",
				)
				.bind(draft.author_subject_id)
				.bind(&draft.author_name)
				.bind(&draft.body)
				.execute(pool)
				.await?;

				sqlx::query_as(
					"SELECT id, author_subject_id, author_name, body, created_at_ms FROM chat_messages WHERE id = ?",
				)
				.bind(res.last_insert_id() as i64)
				.fetch_one(pool)
				.await?
			}
		};

		let msg = row_to_message(row)?;
		debug!(id = msg.id, author = %msg.author_name, "message stored");
		Ok(msg)
	}

	/// The `limit` most recent messages, oldest first. A non-positive limit yields nothing.
	pub async fn history(&self, limit: i64) -> Result<Vec<ChatMessage>, StoreError> {
		if limit <= 0 {
			return Ok(Vec::new());
		}

		let rows: Vec<MessageRow> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, author_subject_id, author_name, body, created_at_ms FROM chat_messages \
					ORDER BY id DESC LIMIT ?",
				)
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, author_subject_id, author_name, body, created_at_ms FROM chat_messages \
					ORDER BY id DESC LIMIT $1",
				)
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
			StoreBackend::Mysql(pool) => {
				sqlx::query_as(
					"SELECT id, author_subject_id, author_name, body, created_at_ms FROM chat_messages \
					ORDER BY id DESC LIMIT ?",
				)
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
		};

		let mut out = rows.into_iter().map(row_to_message).collect::<Result<Vec<_>, _>>()?;
		out.reverse();
		Ok(out)
	}

	/// Remove one message. Unknown ids are not an error.
	pub async fn delete_by_id(&self, id: i64) -> Result<(), StoreError> {
		let affected = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query("DELETE FROM chat_messages WHERE id = ?")
				.bind(id)
				.execute(pool)
				.await?
				.rows_affected(),
			StoreBackend::Postgres(pool) => sqlx::query("DELETE FROM chat_messages WHERE id = $1")
				.bind(id)
				.execute(pool)
				.await?
				.rows_affected(),
			StoreBackend::Mysql(pool) => sqlx::query("DELETE FROM chat_messages WHERE id = ?")
				.bind(id)
				.execute(pool)
				.await?
				.rows_affected(),
		};

		debug!(id, affected, "delete_by_id");
		Ok(())
	}

	/// Delete everything created before `now - horizon` on the database clock; returns the row count.
	pub async fn delete_older_than(&self, horizon: Duration) -> Result<u64, StoreError> {
		let horizon_ms = horizon_ms(horizon);

		let affected = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query(
				"DELETE FROM chat_messages WHERE created_at_ms < \
				(CAST(strftime('%s','now') AS INTEGER) * 1000 + CAST(substr(strftime('%f','now'), 4, 3) AS INTEGER)) - ?",
			)
			.bind(horizon_ms)
			.execute(pool)
			.await?
			.rows_affected(),
			StoreBackend::Postgres(pool) => sqlx::query(
				"DELETE FROM chat_messages WHERE created_at_ms < \
				(EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT - $1",
			)
			.bind(horizon_ms)
			.execute(pool)
			.await?
			.rows_affected(),
			StoreBackend::Mysql(pool) => sqlx::query(
				"DELETE FROM chat_messages WHERE created_at_ms < CAST(UNIX_TIMESTAMP(NOW(3)) * 1000 AS SIGNED) - ?",
			)
			.bind(horizon_ms)
			.execute(pool)
			.await?
			.rows_affected(),
		};

		Ok(affected)
	}
}
