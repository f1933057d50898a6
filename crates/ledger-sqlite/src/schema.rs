pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE port_fact (
  fact_id               INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id               TEXT NOT NULL,
  protocol              TEXT NOT NULL CHECK (protocol IN ('tcp','udp')),
  port                  INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
  first_seen_ms         INTEGER NOT NULL,
  last_seen_ms          INTEGER NOT NULL,
  last_disappeared_ms   INTEGER,
  state                 TEXT NOT NULL CHECK (state IN ('active','disappeared')),
  pid                   INTEGER NOT NULL DEFAULT 0,
  process_name          TEXT NOT NULL DEFAULT '',
  cmdline               TEXT NOT NULL DEFAULT '',
  total_seen_count      INTEGER NOT NULL DEFAULT 1 CHECK (total_seen_count >= 0),
  total_uptime_seconds  INTEGER NOT NULL DEFAULT 0,
  UNIQUE (host_id, protocol, port)
);

CREATE TABLE port_event (
  event_id      INTEGER PRIMARY KEY AUTOINCREMENT,
  fact_id       INTEGER NOT NULL REFERENCES port_fact(fact_id) ON DELETE CASCADE,
  kind          TEXT NOT NULL CHECK (kind IN ('appeared','alive','process_change','disappeared','acknowledged','diagnosed')),
  at_ms         INTEGER NOT NULL,
  pid           INTEGER NOT NULL DEFAULT 0,
  process_name  TEXT NOT NULL DEFAULT '',
  detail        TEXT
);

CREATE TRIGGER trg_port_event_no_update
BEFORE UPDATE ON port_event
BEGIN
  SELECT RAISE(FAIL, 'port_event is append-only');
END;

-- joined to port_fact by tuple only, never by key
CREATE TABLE port_note (
  note_id       INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id       TEXT NOT NULL,
  protocol      TEXT NOT NULL CHECK (protocol IN ('tcp','udp')),
  port          INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
  title         TEXT,
  description   TEXT,
  owner         TEXT,
  risk_level    TEXT NOT NULL CHECK (risk_level IN ('trusted','expected','suspicious')) DEFAULT 'expected',
  is_pinned     INTEGER NOT NULL CHECK (is_pinned IN (0,1)) DEFAULT 0,
  UNIQUE (host_id, protocol, port)
);

CREATE INDEX idx_fact_host ON port_fact(host_id);
CREATE INDEX idx_fact_state ON port_fact(host_id, state);
CREATE INDEX idx_event_fact ON port_event(fact_id, event_id);
CREATE INDEX idx_note_host ON port_note(host_id);

COMMIT;
"#;
