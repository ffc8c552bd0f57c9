//! # ORM能力ポリシー
//!
//! テーブル・カラム単位の許可リスト。既定は全拒否で、`on_ready` 中または
//! 直後に一度だけ適用される。適用後は読み取り専用。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use challenge_types::{OrmQuery, QueryFilter, TableRuleWire};

use crate::error::OrmError;

/// テーブル単位の許可ルール。
#[derive(Debug, Clone, Default)]
pub struct TableRule {
    /// 読み取りを許可するカラム
    pub read_columns: BTreeSet<String>,
    /// INSERTを許可するカラム
    pub insert_columns: BTreeSet<String>,
    /// UPDATEを許可するカラム
    pub update_columns: BTreeSet<String>,
    /// DELETEの可否
    pub delete_allowed: bool,
}

impl TableRule {
    /// 空のルール（全拒否）。
    pub fn new() -> Self {
        Self::default()
    }

    /// 読み取り許可カラムを追加する。
    pub fn allow_read<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// INSERT許可カラムを追加する。
    pub fn allow_insert<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert_columns
            .extend(columns.into_iter().map(Into::into));
        self
    }

    /// UPDATE許可カラムを追加する。
    pub fn allow_update<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_columns
            .extend(columns.into_iter().map(Into::into));
        self
    }

    /// DELETEを許可する。
    pub fn allow_delete(mut self) -> Self {
        self.delete_allowed = true;
        self
    }
}

/// テーブル名からルールへのマッピング。既定は空（全拒否）。
#[derive(Debug, Clone, Default)]
pub struct OrmPolicy {
    tables: BTreeMap<String, TableRule>,
}

impl OrmPolicy {
    /// 空のポリシー（全拒否）。
    pub fn new() -> Self {
        Self::default()
    }

    /// テーブルのルールを設定する。
    pub fn with_table(mut self, table: impl Into<String>, rule: TableRule) -> Self {
        self.tables.insert(table.into(), rule);
        self
    }

    fn rule(&self, table: &str) -> Result<&TableRule, OrmError> {
        self.tables
            .get(table)
            .ok_or_else(|| OrmError::Forbidden(table.to_string()))
    }

    /// 読み取りクエリのカラム集合を検査する。
    pub fn check_read(&self, table: &str, columns: Option<&[String]>) -> Result<(), OrmError> {
        let rule = self.rule(table)?;
        match columns {
            // カラム未指定は許可済みカラム全体の読み取り
            None => {
                if rule.read_columns.is_empty() {
                    return Err(OrmError::Forbidden(table.to_string()));
                }
            }
            Some(columns) => {
                for column in columns {
                    if !rule.read_columns.contains(column) {
                        return Err(OrmError::Forbidden(column.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// INSERTのカラム集合を検査する。
    pub fn check_insert(&self, table: &str, columns: &[String]) -> Result<(), OrmError> {
        let rule = self.rule(table)?;
        for column in columns {
            if !rule.insert_columns.contains(column) {
                return Err(OrmError::Forbidden(column.clone()));
            }
        }
        Ok(())
    }

    /// UPDATEのカラム集合を検査する。
    pub fn check_update(&self, table: &str, columns: &[String]) -> Result<(), OrmError> {
        let rule = self.rule(table)?;
        for column in columns {
            if !rule.update_columns.contains(column) {
                return Err(OrmError::Forbidden(column.clone()));
            }
        }
        Ok(())
    }

    /// DELETEを検査する。WHERE句のないDELETEはポリシーに関わらず拒否。
    pub fn check_delete(&self, table: &str, filters: &[QueryFilter]) -> Result<(), OrmError> {
        if filters.is_empty() {
            return Err(OrmError::UnsafeDelete);
        }
        let rule = self.rule(table)?;
        if !rule.delete_allowed {
            return Err(OrmError::Forbidden(table.to_string()));
        }
        Ok(())
    }

    /// クエリ全体をマーシャリング前に検査する。
    pub fn check_query(&self, query: &OrmQuery) -> Result<(), OrmError> {
        use challenge_types::OrmOperation;
        match query.operation {
            OrmOperation::Select | OrmOperation::Count => {
                self.check_read(&query.table, query.columns.as_deref())
            }
            OrmOperation::Insert => {
                let columns: Vec<String> = query
                    .values
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|cv| cv.column.clone())
                    .collect();
                self.check_insert(&query.table, &columns)
            }
            OrmOperation::Update => {
                let columns: Vec<String> = query
                    .set_values
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|cv| cv.column.clone())
                    .collect();
                self.check_update(&query.table, &columns)
            }
            OrmOperation::Delete => self.check_delete(&query.table, &query.filters),
        }
    }

    /// PolicyAnnounceフレーム用のワイヤ表現。
    pub fn to_wire(&self) -> BTreeMap<String, TableRuleWire> {
        self.tables
            .iter()
            .map(|(table, rule)| {
                (
                    table.clone(),
                    TableRuleWire {
                        read_columns: rule.read_columns.iter().cloned().collect(),
                        insert_columns: rule.insert_columns.iter().cloned().collect(),
                        update_columns: rule.update_columns.iter().cloned().collect(),
                        delete_allowed: rule.delete_allowed,
                    },
                )
            })
            .collect()
    }
}

/// 一度だけ書き込めるポリシーセル。適用前は全拒否として振る舞う。
#[derive(Debug, Default)]
pub struct PolicyCell {
    cell: OnceLock<Arc<OrmPolicy>>,
}

impl PolicyCell {
    /// 未適用状態のセルを作る。
    pub fn new() -> Self {
        Self::default()
    }

    /// ポリシーを適用する。2回目以降の適用はエラー。
    pub fn apply(&self, policy: OrmPolicy) -> Result<(), OrmError> {
        self.cell
            .set(Arc::new(policy))
            .map_err(|_| OrmError::Forbidden("ポリシーは適用済みです".to_string()))
    }

    /// 現在のポリシー。未適用ならNone（全拒否）。
    pub fn get(&self) -> Option<Arc<OrmPolicy>> {
        self.cell.get().cloned()
    }
}
