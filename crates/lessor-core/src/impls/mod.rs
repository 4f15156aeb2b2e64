//! Impls - RuntimeState の実装
//!
//! - **sqlite**: トランザクションで相互排他を担保する正本
//! - **file**: JSON ドキュメント。DB が使えない環境向け

pub mod file;
pub mod sqlite;

pub use self::file::FileRuntimeState;
pub use self::sqlite::SqliteRuntimeState;
