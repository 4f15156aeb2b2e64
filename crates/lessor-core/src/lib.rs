//! lessor-core
//!
//! Lease-based coordination for agents sharing one workspace.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, transition, lease, events, message, errors）
//! - **ports**: 抽象化レイヤー（Clock, RuntimeState）
//! - **impls**: RuntimeState の実装（SQLite が正本、File は弱いフォールバック）
//! - **scheduler**: タスクのリース・状態遷移・回収（ライフサイクルイベントの唯一の発行元）
//! - **reservation**: ファイル予約（`file_reservations` テーブル）
//! - **coordinator**: プロトコルメッセージの振り分け
//! - **event_log**: 追記専用の監査ログ
//! - **config** / **runtime**: 環境変数からの設定とバックエンド選択

pub mod config;
pub mod coordinator;
pub mod domain;
pub mod event_log;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod reservation;
pub mod retry;
pub mod runtime;
pub mod scheduler;

pub use self::config::{RuntimeConfig, RuntimeMode};
pub use self::coordinator::{Coordinator, DispatchOutcome};
pub use self::domain::{LeaseError, ResourceRef, TaskState};
pub use self::event_log::EventLog;
pub use self::observability::RuntimeStatus;
pub use self::reservation::{AcquireLease, ReservationManager};
pub use self::runtime::{open_runtime_state, open_sqlite};
pub use self::scheduler::LeaseScheduler;
