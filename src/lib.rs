/*!
# Sales Leaderboard

Voucher leaderboard service for a sales team, backed by spreadsheet tables.

## Overview

Each subscription plan (12, 6 and 3 month) has two tables of vouchers: a
regular table filled in by the sales team and a cash table handed out by the
service itself. The service reads all six tables, ranks salespeople by the
vouchers they assigned, hands out cash vouchers on request and answers
free-text voucher lookups through a chat assistant.

## Architecture

### Data Layer
- **SheetSource**: async trait over the tabular backend (`GoogleSheets` for the
  Sheets v4 values API, `MemorySheets` for tests and local runs)
- Fixed voucher layout `A:G`: code, status, client name, phone, email,
  salesperson, date assigned

### Services
- Aggregator - Concurrent reads of all six tables, ranking and a 30 s summary cache
- Cash Assigner - Claims the first available cash voucher and invalidates the cache
- Completion Gateway - Primary completion provider with a credentialed fallback
- OAuth / Credential Store - PKCE exchange for the fallback provider's key
- Query Responder - Keyword search over the regular tables fed to the gateway

### HTTP Layer (feature `web`)
- `GET /api/sheets` - Leaderboard summary (`?plan=` re-ranks one plan)
- `POST /api/cash-process` - Assign a cash voucher
- `POST /api/chat` - Chat assistant
- `GET /api/auth/openrouter`, `GET /api/auth/openrouter/callback` - OAuth flow
- `GET /health` - Liveness

## Modules

- **voucher**: Row model, plan keys, name normalization and date parsing
- **sheets**: `SheetSource` trait and its implementations
- **aggregator**: Summary computation and caching
- **assigner**: Cash voucher assignment
- **gateway**: Completion providers and fallback
- **oauth**: PKCE helpers and code exchange
- **credentials**: Per-session fallback provider key store
- **responder**: Chat and agent replies
- **config**: Environment configuration
- **error**: Library error type
- **app**: Routing and handlers
*/

pub mod aggregator;
pub mod assigner;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod responder;
pub mod sheets;
pub mod voucher;

#[cfg(feature = "web")]
pub mod app;

pub use error::{LeaderboardError, Result};
