//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。
//! 実装は `impls`（SQLite / File）にある。
//!
//! # 設計原則
//! - SQLite が正本（source of truth）。相互排他はトランザクションの原子性だけで担保する
//! - File バックエンドは DB が使えない環境向けの弱いフォールバック

pub mod clock;
pub mod runtime_state;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::runtime_state::{BackendKind, RefreshReport, RuntimeState};
