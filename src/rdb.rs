//! The relational identity store: users and games.
//!
//! Access goes through the [`RelationalDatabase`] trait so the backend is
//! pluggable. Two implementations ship: [`SqliteRdb`], the durable backend,
//! and [`InMemoryRdb`] for tests and `-t` runs. Errors are classified into
//! not-found, constraint violation (the backend's native message is kept),
//! and backend-unavailable; unavailability is retried once right here at the
//! storage boundary.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::entity::{Game, GameId, User, UserId};
use crate::error::ApiError;

/// Retry the expression once if the first attempt reports the backend
/// unavailable. Everything else is returned as-is.
macro_rules! retry_once {
    ($attempt:expr) => {
        match $attempt {
            Err(ApiError::Unavailable(_)) => $attempt,
            result => result,
        }
    };
}

#[async_trait]
pub trait RelationalDatabase: Send + Sync {
    async fn create_user(
        &self,
        userid: UserId,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<(), ApiError>;

    async fn get_user_by_id(&self, userid: UserId) -> Result<User, ApiError>;

    /// Look up by username or email.
    async fn get_user_by_login(&self, login: &str) -> Result<User, ApiError>;

    async fn set_user_admin(&self, userid: UserId, value: bool) -> Result<(), ApiError>;

    async fn set_user_verified(&self, userid: UserId, value: bool) -> Result<(), ApiError>;

    async fn create_game(
        &self,
        name: &str,
        ownerid: UserId,
        capacity: u32,
        image: &str,
        internal_ports: &[u16],
    ) -> Result<GameId, ApiError>;

    async fn get_game_by_id(&self, gameid: GameId) -> Result<Game, ApiError>;

    async fn get_game_by_name(&self, name: &str) -> Result<Game, ApiError>;

    async fn get_all_games(&self) -> Result<Vec<Game>, ApiError>;

    async fn get_games_by_owner(&self, ownerid: UserId) -> Result<Vec<Game>, ApiError>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

const CREATE_TABLE_USERS: &str = "CREATE TABLE IF NOT EXISTS users (
        userid      TEXT PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        email       TEXT NOT NULL UNIQUE,
        password    TEXT NOT NULL,
        is_verified INTEGER NOT NULL DEFAULT 0,
        is_admin    INTEGER NOT NULL DEFAULT 0
    )";

const CREATE_TABLE_GAMES: &str = "CREATE TABLE IF NOT EXISTS games (
        gameid         INTEGER PRIMARY KEY AUTOINCREMENT,
        name           TEXT NOT NULL UNIQUE,
        ownerid        TEXT NOT NULL REFERENCES users(userid),
        capacity       INTEGER NOT NULL CHECK (capacity >= 1),
        image          TEXT NOT NULL,
        internal_ports TEXT NOT NULL
    )";

/// Durable identity store on SQLite via sqlx.
pub struct SqliteRdb {
    pool: SqlitePool,
}

impl SqliteRdb {
    /// Open (creating if missing) the database at `url` and install the schema.
    ///
    /// # Errors
    /// Returns `Unavailable` if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn connect(url: &str) -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ApiError::Unavailable(format!("bad sqlite url {url}: {e}")))?
            .create_if_missing(true);

        // A :memory: database exists per-connection; keep the pool at one so the
        // schema is visible to every query.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;

        let rdb = SqliteRdb { pool };
        rdb.install().await?;
        Ok(rdb)
    }

    async fn install(&self) -> Result<(), ApiError> {
        for sql in [CREATE_TABLE_USERS, CREATE_TABLE_GAMES] {
            sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn fetch_user(&self, sql: &str, bind: &str) -> Result<User, ApiError> {
        let row = sqlx::query(sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.map_or_else(|| Err(ApiError::NotFound("User".to_string())), |r| user_from_row(&r))
    }

    async fn fetch_games(&self, sql: &str, bind: Option<&str>) -> Result<Vec<Game>, ApiError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx)?;
        rows.iter().map(game_from_row).collect()
    }
}

fn map_sqlx(err: sqlx::Error) -> ApiError {
    match err {
        sqlx::Error::RowNotFound => ApiError::NotFound("Row".to_string()),
        sqlx::Error::Database(db) => ApiError::Constraint(db.message().to_string()),
        other => ApiError::Unavailable(other.to_string()),
    }
}

fn parse_uuid(text: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(text).map_err(|e| ApiError::Unavailable(format!("corrupt uuid in store: {e}")))
}

fn user_from_row(row: &SqliteRow) -> Result<User, ApiError> {
    Ok(User {
        userid: parse_uuid(&row.try_get::<String, _>("userid").map_err(|e| corrupt(&e))?)?,
        name: row.try_get("name").map_err(|e| corrupt(&e))?,
        email: row.try_get("email").map_err(|e| corrupt(&e))?,
        password_hash: row.try_get("password").map_err(|e| corrupt(&e))?,
        is_verified: row.try_get("is_verified").map_err(|e| corrupt(&e))?,
        is_admin: row.try_get("is_admin").map_err(|e| corrupt(&e))?,
    })
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn game_from_row(row: &SqliteRow) -> Result<Game, ApiError> {
    let ports_json: String = row.try_get("internal_ports").map_err(|e| corrupt(&e))?;
    let internal_ports: Vec<u16> = serde_json::from_str(&ports_json)
        .map_err(|e| ApiError::Unavailable(format!("corrupt port list in store: {e}")))?;
    Ok(Game {
        gameid: row.try_get("gameid").map_err(|e| corrupt(&e))?,
        name: row.try_get("name").map_err(|e| corrupt(&e))?,
        ownerid: parse_uuid(&row.try_get::<String, _>("ownerid").map_err(|e| corrupt(&e))?)?,
        capacity: row.try_get::<i64, _>("capacity").map_err(|e| corrupt(&e))? as u32,
        image: row.try_get("image").map_err(|e| corrupt(&e))?,
        internal_ports,
    })
}

fn corrupt(err: &sqlx::Error) -> ApiError {
    ApiError::Unavailable(format!("corrupt row in store: {err}"))
}

#[async_trait]
impl RelationalDatabase for SqliteRdb {
    async fn create_user(
        &self,
        userid: UserId,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<(), ApiError> {
        retry_once!(
            sqlx::query("INSERT INTO users (userid, name, email, password) VALUES (?1, ?2, ?3, ?4)")
                .bind(userid.to_string())
                .bind(name)
                .bind(email)
                .bind(password_hash)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)
        )?;
        Ok(())
    }

    async fn get_user_by_id(&self, userid: UserId) -> Result<User, ApiError> {
        retry_once!(
            self
                .fetch_user("SELECT * FROM users WHERE userid = ?1", &userid.to_string())
                .await
        )
    }

    async fn get_user_by_login(&self, login: &str) -> Result<User, ApiError> {
        retry_once!(
            self
                .fetch_user("SELECT * FROM users WHERE name = ?1 OR email = ?1", login)
                .await
        )
    }

    async fn set_user_admin(&self, userid: UserId, value: bool) -> Result<(), ApiError> {
        let result = retry_once!(
            sqlx::query("UPDATE users SET is_admin = ?2 WHERE userid = ?1")
                .bind(userid.to_string())
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)
        )?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("User".to_string()));
        }
        Ok(())
    }

    async fn set_user_verified(&self, userid: UserId, value: bool) -> Result<(), ApiError> {
        let result = retry_once!(
            sqlx::query("UPDATE users SET is_verified = ?2 WHERE userid = ?1")
                .bind(userid.to_string())
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)
        )?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("User".to_string()));
        }
        Ok(())
    }

    async fn create_game(
        &self,
        name: &str,
        ownerid: UserId,
        capacity: u32,
        image: &str,
        internal_ports: &[u16],
    ) -> Result<GameId, ApiError> {
        let ports_json = serde_json::to_string(internal_ports)
            .map_err(|e| ApiError::BadRequest(format!("bad port list: {e}")))?;
        let result = retry_once!(
            sqlx::query(
                "INSERT INTO games (name, ownerid, capacity, image, internal_ports)
                  VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(name)
            .bind(ownerid.to_string())
            .bind(i64::from(capacity))
            .bind(image)
            .bind(&ports_json)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)
        )?;
        Ok(result.last_insert_rowid())
    }

    async fn get_game_by_id(&self, gameid: GameId) -> Result<Game, ApiError> {
        let row = retry_once!(
            sqlx::query("SELECT * FROM games WHERE gameid = ?1")
                .bind(gameid)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)
        )?;
        row.map_or_else(|| Err(ApiError::NotFound("Game".to_string())), |r| game_from_row(&r))
    }

    async fn get_game_by_name(&self, name: &str) -> Result<Game, ApiError> {
        let row = retry_once!(
            sqlx::query("SELECT * FROM games WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)
        )?;
        row.map_or_else(|| Err(ApiError::NotFound("Game".to_string())), |r| game_from_row(&r))
    }

    async fn get_all_games(&self) -> Result<Vec<Game>, ApiError> {
        retry_once!(self.fetch_games("SELECT * FROM games ORDER BY gameid", None).await)
    }

    async fn get_games_by_owner(&self, ownerid: UserId) -> Result<Vec<Game>, ApiError> {
        retry_once!(
            self
                .fetch_games(
                    "SELECT * FROM games WHERE ownerid = ?1 ORDER BY gameid",
                    Some(&ownerid.to_string()),
                )
                .await
        )
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InMemoryTables {
    users: HashMap<UserId, User>,
    games: HashMap<GameId, Game>,
    next_gameid: GameId,
}

/// Database-free identity store. No durability; used by tests and `-t` runs.
pub struct InMemoryRdb {
    tables: Mutex<InMemoryTables>,
}

impl InMemoryRdb {
    #[must_use]
    pub fn new() -> Self {
        InMemoryRdb {
            tables: Mutex::new(InMemoryTables {
                next_gameid: 1,
                ..InMemoryTables::default()
            }),
        }
    }
}

impl Default for InMemoryRdb {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalDatabase for InMemoryRdb {
    async fn create_user(
        &self,
        userid: UserId,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<(), ApiError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.users.values().any(|u| u.name == name) {
            return Err(ApiError::Constraint("UNIQUE constraint failed: users.name".to_string()));
        }
        if tables.users.values().any(|u| u.email == email) {
            return Err(ApiError::Constraint("UNIQUE constraint failed: users.email".to_string()));
        }
        tables.users.insert(
            userid,
            User {
                userid,
                name: name.to_string(),
                email: email.to_string(),
                password_hash: password_hash.to_string(),
                is_verified: false,
                is_admin: false,
            },
        );
        Ok(())
    }

    async fn get_user_by_id(&self, userid: UserId) -> Result<User, ApiError> {
        self
            .tables
            .lock()
            .unwrap()
            .users
            .get(&userid)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("User".to_string()))
    }

    async fn get_user_by_login(&self, login: &str) -> Result<User, ApiError> {
        self
            .tables
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.name == login || u.email == login)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("User".to_string()))
    }

    async fn set_user_admin(&self, userid: UserId, value: bool) -> Result<(), ApiError> {
        let mut tables = self.tables.lock().unwrap();
        let user = tables
            .users
            .get_mut(&userid)
            .ok_or_else(|| ApiError::NotFound("User".to_string()))?;
        user.is_admin = value;
        Ok(())
    }

    async fn set_user_verified(&self, userid: UserId, value: bool) -> Result<(), ApiError> {
        let mut tables = self.tables.lock().unwrap();
        let user = tables
            .users
            .get_mut(&userid)
            .ok_or_else(|| ApiError::NotFound("User".to_string()))?;
        user.is_verified = value;
        Ok(())
    }

    async fn create_game(
        &self,
        name: &str,
        ownerid: UserId,
        capacity: u32,
        image: &str,
        internal_ports: &[u16],
    ) -> Result<GameId, ApiError> {
        let mut tables = self.tables.lock().unwrap();
        if capacity < 1 {
            return Err(ApiError::Constraint("CHECK constraint failed: capacity >= 1".to_string()));
        }
        if tables.games.values().any(|g| g.name == name) {
            return Err(ApiError::Constraint("UNIQUE constraint failed: games.name".to_string()));
        }
        let gameid = tables.next_gameid;
        tables.next_gameid += 1;
        tables.games.insert(
            gameid,
            Game {
                gameid,
                name: name.to_string(),
                ownerid,
                capacity,
                image: image.to_string(),
                internal_ports: internal_ports.to_vec(),
            },
        );
        Ok(gameid)
    }

    async fn get_game_by_id(&self, gameid: GameId) -> Result<Game, ApiError> {
        self
            .tables
            .lock()
            .unwrap()
            .games
            .get(&gameid)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("Game".to_string()))
    }

    async fn get_game_by_name(&self, name: &str) -> Result<Game, ApiError> {
        self
            .tables
            .lock()
            .unwrap()
            .games
            .values()
            .find(|g| g.name == name)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("Game".to_string()))
    }

    async fn get_all_games(&self) -> Result<Vec<Game>, ApiError> {
        let mut games: Vec<Game> = self.tables.lock().unwrap().games.values().cloned().collect();
        games.sort_by_key(|g| g.gameid);
        Ok(games)
    }

    async fn get_games_by_owner(&self, ownerid: UserId) -> Result<Vec<Game>, ApiError> {
        let mut games: Vec<Game> = self
            .tables
            .lock()
            .unwrap()
            .games
            .values()
            .filter(|g| g.ownerid == ownerid)
            .cloned()
            .collect();
        games.sort_by_key(|g| g.gameid);
        Ok(games)
    }
}
