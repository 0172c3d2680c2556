/// Idempotent DDL, executed on every connect.
pub(crate) const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS news_sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    parser TEXT NOT NULL DEFAULT 'feed'
);

CREATE TABLE IF NOT EXISTS news_items (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    url TEXT,
    summary TEXT NOT NULL,
    source TEXT NOT NULL,
    published_at TEXT NOT NULL,
    raw_text TEXT
);

CREATE INDEX IF NOT EXISTS idx_news_items_url ON news_items (url);
CREATE INDEX IF NOT EXISTS idx_news_items_title ON news_items (title);

CREATE TABLE IF NOT EXISTS posts (
    id TEXT PRIMARY KEY,
    news_item_id TEXT NOT NULL REFERENCES news_items(id),
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    retry_after TEXT,
    claim_token TEXT,
    claimed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_posts_status ON posts (status);
CREATE INDEX IF NOT EXISTS idx_posts_news_item ON posts (news_item_id);

CREATE TABLE IF NOT EXISTS generation_attempts (
    news_item_id TEXT PRIMARY KEY REFERENCES news_items(id) ON DELETE CASCADE,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    last_attempt_at TEXT NOT NULL,
    next_attempt_at TEXT NOT NULL
);
";

pub(crate) const NEWS_ITEM_COLUMNS: &str = "id, title, url, summary, source, published_at, raw_text";

pub(crate) const POST_COLUMNS: &str =
    "id, news_item_id, title, content, status, created_at, attempts, last_error, retry_after";

pub(crate) const SOURCE_COLUMNS: &str = "id, name, url, is_active, parser";
