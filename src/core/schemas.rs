//! Centralized database schema definitions.
//!
//! Everything the subsystem persists lives in one SQLite database, `registry.db`:
//! stores and their scrape history, latest prices, groups, memberships and the
//! candidate validation queue.

pub const REGISTRY_DB_NAME: &str = "registry.db";
pub const AUDIT_LOG_NAME: &str = "registry.events.jsonl";
pub const CONFIG_FILE_NAME: &str = "shelfwise.toml";

pub const STORES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS stores (
        id INTEGER PRIMARY KEY,
        chain TEXT NOT NULL,
        division TEXT NOT NULL DEFAULT '',
        latitude REAL,
        longitude REAL,
        active INTEGER NOT NULL DEFAULT 1,
        last_scraped INTEGER,           -- epoch seconds, NULL = never scraped
        needs_rescraping INTEGER NOT NULL DEFAULT 0,
        scheduled_at INTEGER,           -- lease acquisition time, NULL = unleased
        lease_token TEXT
    )
";
pub const STORES_CHAIN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_stores_chain ON stores(chain)";

pub const PRICES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS prices (
        store_id INTEGER NOT NULL,
        product_id TEXT NOT NULL,
        price REAL NOT NULL,
        observed_at INTEGER NOT NULL,
        PRIMARY KEY(store_id, product_id),
        FOREIGN KEY(store_id) REFERENCES stores(id) ON DELETE CASCADE
    )
";

pub const GROUPS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS store_groups (
        id TEXT PRIMARY KEY,
        chain TEXT NOT NULL,
        method TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        active INTEGER NOT NULL DEFAULT 1,
        representative_id INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        FOREIGN KEY(representative_id) REFERENCES stores(id)
    )
";
pub const GROUPS_CHAIN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_store_groups_chain ON store_groups(chain)";

/// `store_id` is the primary key: a store belongs to at most one group.
pub const MEMBERS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS store_group_members (
        store_id INTEGER PRIMARY KEY,
        group_id TEXT NOT NULL,
        FOREIGN KEY(store_id) REFERENCES stores(id),
        FOREIGN KEY(group_id) REFERENCES store_groups(id) ON DELETE CASCADE
    )
";
pub const MEMBERS_GROUP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_members_group ON store_group_members(group_id)";

/// `store_id` is the primary key: a store is pending in at most one group.
pub const CANDIDATES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS group_candidates (
        store_id INTEGER PRIMARY KEY,
        group_id TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        enqueued_at INTEGER NOT NULL,
        FOREIGN KEY(store_id) REFERENCES stores(id),
        FOREIGN KEY(group_id) REFERENCES store_groups(id) ON DELETE CASCADE
    )
";

pub const REGISTRY_DB_SCHEMA: &[&str] = &[
    STORES_SCHEMA,
    STORES_CHAIN_INDEX,
    PRICES_SCHEMA,
    GROUPS_SCHEMA,
    GROUPS_CHAIN_INDEX,
    MEMBERS_SCHEMA,
    MEMBERS_GROUP_INDEX,
    CANDIDATES_SCHEMA,
];
