// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! Data access machinery shared by every storage-backed crate: the [`ID`]
//! newtype, the [`StorageError`] taxonomy, the postgres client plumbing
//! ([`new_client`], [`EasyTransaction`]) and the [`DBTable`] row-mapping
//! trait with its guarded insert/update wrappers.

mod error;

pub use error::{retry_on_deadlock, StorageError, StorageResult};

use std::{any::type_name, collections::HashMap, hash::Hash, marker::PhantomData};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio_postgres::{
    types::{FromSql, ToSql},
    Client, NoTls, Transaction,
};

pub use tokio_postgres::Row;

/// Object-safe bound for boxed SQL parameters.
pub trait ToSqlObject: Send + Sync + 'static {
    fn as_sql(&self) -> &(dyn ToSql + Sync);
}

impl<T: ToSql + Send + Sync + 'static> ToSqlObject for T {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        self
    }
}

#[derive(
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Debug,
    Hash,
    derive_more::Into,
    derive_more::From,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
)]
pub struct ID(uuid::Uuid);

/// UUID impl
impl ID {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(uuid::Uuid::nil())
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl Default for ID {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for ID {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::try_parse(s)?))
    }
}

impl std::fmt::Display for ID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl ToSql for ID {
    fn to_sql(
        &self,
        ty: &tokio_postgres::types::Type,
        out: &mut tokio_postgres::types::private::BytesMut,
    ) -> Result<tokio_postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>>
    where
        Self: Sized,
    {
        self.0.to_sql(ty, out)
    }

    fn accepts(ty: &tokio_postgres::types::Type) -> bool
    where
        Self: Sized,
    {
        <uuid::Uuid as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}

impl FromSql<'_> for ID {
    fn from_sql(
        ty: &tokio_postgres::types::Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(ID(uuid::Uuid::from_sql(ty, raw)?))
    }

    fn accepts(ty: &tokio_postgres::types::Type) -> bool {
        <uuid::Uuid as FromSql>::accepts(ty)
    }
}

/// Typed foreign key: an [`ID`] that remembers which table it points into.
pub struct FKey<T: DBTable> {
    id: ID,

    _p: PhantomData<T>,
}

impl<T: DBTable> Serialize for FKey<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.id.serialize(serializer)
    }
}

impl<'de, T: DBTable> Deserialize<'de> for FKey<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = ID::deserialize(deserializer)?;

        Ok(Self {
            _p: PhantomData,
            id,
        })
    }
}

impl<T: DBTable> std::fmt::Debug for FKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tn = type_name::<T>();
        write!(f, "[Fk<{}> -> {}]", tn, self.id)
    }
}

impl<T: DBTable> std::fmt::Display for FKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.id.fmt(f)
    }
}

impl<T: DBTable> PartialEq for FKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id.eq(&other.id)
    }
}

impl<T: DBTable> Eq for FKey<T> {}

impl<T: DBTable> Clone for FKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: DBTable> Copy for FKey<T> {}

impl<T: DBTable> Hash for FKey<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl<'a, T: DBTable> FromSql<'a> for FKey<T> {
    fn from_sql(
        ty: &tokio_postgres::types::Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let id = uuid::Uuid::from_sql(ty, raw)?;

        Ok(FKey {
            id: ID::from(id),
            _p: PhantomData,
        })
    }

    fn accepts(ty: &tokio_postgres::types::Type) -> bool {
        <uuid::Uuid as FromSql>::accepts(ty)
    }
}

impl<T: DBTable> ToSql for FKey<T> {
    fn to_sql(
        &self,
        ty: &tokio_postgres::types::Type,
        out: &mut tokio_postgres::types::private::BytesMut,
    ) -> Result<tokio_postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>>
    where
        Self: Sized,
    {
        self.id.to_sql(ty, out)
    }

    fn accepts(ty: &tokio_postgres::types::Type) -> bool
    where
        Self: Sized,
    {
        <ID as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}

impl<T: DBTable> FKey<T> {
    pub async fn get(
        &self,
        transaction: &mut EasyTransaction<'_>,
    ) -> StorageResult<ExistingRow<T>> {
        T::get(transaction, self.id).await
    }

    pub fn from_id(id: ID) -> Self {
        Self {
            id,
            _p: PhantomData,
        }
    }

    pub fn into_id(&self) -> ID {
        self.id
    }

    /// Use this function when first creating a NewRow(T)
    /// for the self referential `id` field
    pub fn new_id_dangling() -> Self {
        Self::from_id(ID::new())
    }
}

pub fn col(name: &'static str, v: impl ToSqlObject) -> (&'static str, Box<dyn ToSqlObject>) {
    (name, Box::new(v))
}

#[derive(Clone, Debug, Copy, Hash)]
pub struct ExistingRow<T: DBTable> {
    data: T,
    had_id: ID,
}

impl<T: DBTable> std::ops::Deref for ExistingRow<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T: DBTable> std::ops::DerefMut for ExistingRow<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl<T: DBTable> ExistingRow<T> {
    pub async fn update(&self, client: &mut EasyTransaction<'_>) -> StorageResult<()> {
        assert_eq!(
            self.data.id(),
            self.had_id,
            "user tried to change the id of a model during update"
        );
        self.data.update(client, Protect::new()).await
    }

    pub async fn delete(self, client: &mut EasyTransaction<'_>) -> StorageResult<()> {
        self.data.delete(client, Protect::new()).await
    }

    pub async fn get(client: &mut EasyTransaction<'_>, id: ID) -> StorageResult<Self> {
        T::get(client, id).await
    }

    /// Only for use on a T that is already known to exist in the database.
    pub fn from_existing(v: T) -> Self {
        let had_id = v.id();
        Self { data: v, had_id }
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

/// A row that may or may not already exist in the database,
/// allowing a clean upsert operation
pub struct SchrodingerRow<T>(T);
impl<T: DBTable> SchrodingerRow<T> {
    pub async fn upsert(&self, client: &mut EasyTransaction<'_>) -> StorageResult<FKey<T>> {
        self.0.upsert(client, Protect::new()).await
    }

    pub fn new(v: T) -> Self {
        Self(v)
    }
}

pub struct NewRow<T>(T);
impl<T: DBTable> NewRow<T> {
    pub async fn insert(&self, client: &mut EasyTransaction<'_>) -> StorageResult<FKey<T>> {
        self.0.insert(client, Protect::new()).await
    }

    pub fn new(v: T) -> Self {
        Self(v)
    }
}

pub struct Filter {
    field_name: String,
    value: Box<dyn ToSqlObject>,
    operation: FilterOperation,
}

pub enum FilterOperation {
    EQ,
    LT,
    GT,
    LTE,
    GTE,
    NE,
    IN,
}

pub struct SelectBuilder<T> {
    filters: Vec<Filter>,
    order_by: Option<(String, bool)>,
    _p: PhantomData<T>,
}

pub struct WhereBuilder<T> {
    select: SelectBuilder<T>,
    field_name: String,
}

impl<T: DBTable> WhereBuilder<T> {
    fn with_operation<U>(self, value: U, operation: FilterOperation) -> SelectBuilder<T>
    where
        U: ToSqlObject,
    {
        let mut select = self.select;
        select.filters.push(Filter {
            field_name: self.field_name,
            value: Box::new(value),
            operation,
        });

        select
    }

    pub fn equals<U>(self, value: U) -> SelectBuilder<T>
    where
        U: ToSqlObject,
    {
        self.with_operation(value, FilterOperation::EQ)
    }

    pub fn not_equals<U>(self, value: U) -> SelectBuilder<T>
    where
        U: ToSqlObject,
    {
        self.with_operation(value, FilterOperation::NE)
    }

    pub fn within<U>(self, list: Vec<U>) -> SelectBuilder<T>
    where
        U: ToSqlObject + ToSql + Sync,
    {
        self.with_operation(list, FilterOperation::IN)
    }
}

impl<T: DBTable> Default for SelectBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DBTable> SelectBuilder<T> {
    pub fn new() -> Self {
        Self {
            filters: vec![],
            order_by: None,
            _p: Default::default(),
        }
    }

    pub fn where_field(self, field_name: &str) -> WhereBuilder<T> {
        WhereBuilder {
            select: self,
            field_name: field_name.to_owned(),
        }
    }

    pub fn order_by(mut self, field_name: &str, ascending: bool) -> Self {
        self.order_by = Some((field_name.to_owned(), ascending));
        self
    }

    pub async fn run(
        self,
        transaction: &mut EasyTransaction<'_>,
    ) -> StorageResult<Vec<ExistingRow<T>>> {
        let where_clauses = if self.filters.is_empty() {
            String::new()
        } else {
            let clauses = self
                .filters
                .iter()
                .enumerate()
                .map(|(c, f)| {
                    let operator = match f.operation {
                        FilterOperation::EQ => " = ",
                        FilterOperation::NE => " != ",
                        FilterOperation::GT => " > ",
                        FilterOperation::GTE => " >= ",
                        FilterOperation::LT => " < ",
                        FilterOperation::LTE => " <= ",
                        FilterOperation::IN => " = ANY",
                    };

                    let fname = &f.field_name;
                    let idp = c + 1;
                    if matches!(f.operation, FilterOperation::IN) {
                        format!("({fname} = ANY(${idp}))")
                    } else {
                        format!("({fname} {operator} ${idp})")
                    }
                })
                .join(" AND ");
            format!("WHERE {clauses}")
        };

        let order = match &self.order_by {
            Some((field, true)) => format!("ORDER BY {field} ASC"),
            Some((field, false)) => format!("ORDER BY {field} DESC"),
            None => String::new(),
        };

        let tn = T::table_name();
        let q = format!("SELECT * FROM {tn} {where_clauses} {order};");

        let params: Vec<&(dyn ToSql + Sync)> = self
            .filters
            .iter()
            .map(|f| f.value.as_sql())
            .collect_vec();

        let rows = transaction.query(&q, params.as_slice()).await?;

        T::from_rows(rows)
    }
}

/// If you're making a SQL model, implement this directly,
/// including `id`, `table_name`, `from_row`, and `to_rowlike`.
pub trait DBTable: Sized + 'static + Send + Sync {
    /// The name of the table this should be in
    fn table_name() -> &'static str;

    /// Returns the primary key for this table, as all DBTable
    /// must be PKed by an ID
    fn id(&self) -> ID;

    /// Create an instance of this table from a postgres Row object,
    /// returning Err() on (reasonable) failure.
    fn from_row(row: Row) -> StorageResult<ExistingRow<Self>>;

    /// Should not be implemented by implementors of this trait,
    /// use the default in almost all cases!
    fn from_rows(rows: Vec<Row>) -> StorageResult<Vec<ExistingRow<Self>>> {
        let mut vals = Vec::new();

        for row in rows {
            vals.push(Self::from_row(row)?);
        }

        Ok(vals)
    }

    /// Gives us a "rowlike" that has ToSql values by their column name as key
    fn to_rowlike(&self) -> StorageResult<HashMap<&str, Box<dyn ToSqlObject>>>;

    /// Get a T: DBTable given an ID
    fn get(
        client: &mut EasyTransaction<'_>,
        id: ID,
    ) -> impl std::future::Future<Output = StorageResult<ExistingRow<Self>>> + Send {
        async move {
            let tname = Self::table_name();
            let q = format!("SELECT * FROM {tname} WHERE id = $1;");
            let row = client.query_opt(&q, &[&id]).await?.ok_or_else(|| {
                StorageError::KeyNotFound(format!("no {tname} row for id {id}"))
            })?;

            Self::from_row(row)
        }
    }

    /// Create a SelectBuilder based on some Self: DBTable
    fn select() -> SelectBuilder<Self> {
        SelectBuilder::new()
    }

    // For inserting into the database; called by NewRow internally.
    fn insert(
        &self,
        client: &mut EasyTransaction<'_>,
        _t: Protect,
    ) -> impl std::future::Future<Output = StorageResult<FKey<Self>>> + Send {
        async move {
            let row = self.to_rowlike()?;

            let tname = Self::table_name();

            let mut columns = vec![];
            let mut params = vec![];
            let mut args: Vec<&(dyn ToSql + Sync)> = vec![];

            for (i, (c, v)) in row.iter().enumerate() {
                columns.push(*c);
                params.push(format!("${}", i + 1));
                args.push(v.as_sql());
            }

            let columns = columns.into_iter().join(", ");
            let params = params.into_iter().join(", ");

            let q = format!("INSERT INTO {tname} ({columns}) VALUES ({params});");

            client.execute(q.as_str(), args.as_slice()).await?;

            Ok(FKey::from_id(self.id()))
        }
    }

    // Called by SchrodingerRow<T>; use the default impl.
    fn upsert(
        &self,
        client: &mut EasyTransaction<'_>,
        _t: Protect,
    ) -> impl std::future::Future<Output = StorageResult<FKey<Self>>> + Send {
        async move {
            let row = self.to_rowlike()?;

            let tname = Self::table_name();

            let mut columns = vec![];
            let mut params = vec![];
            let mut args: Vec<&(dyn ToSql + Sync)> = vec![];

            for (i, (c, v)) in row.iter().enumerate() {
                columns.push(*c);
                params.push(format!("${}", i + 1));
                args.push(v.as_sql());
            }

            let update_cols = columns
                .iter()
                .filter(|col| **col != "id")
                .map(|col| format!("{col} = EXCLUDED.{col}"))
                .join(",\n");

            let columns = columns.into_iter().join(", ");
            let params = params.into_iter().join(", ");

            let q = format!(
                "INSERT INTO {tname} ({columns})
                            VALUES ({params})
                            ON CONFLICT (id) DO UPDATE
                                SET {update_cols};"
            );

            tracing::trace!("Does an upsert using query: {q}");

            client.execute(q.as_str(), args.as_slice()).await?;

            Ok(FKey::from_id(self.id()))
        }
    }

    // Called by ExistingRow<T>; use the default impl.
    fn update(
        &self,
        client: &mut EasyTransaction<'_>,
        _t: Protect,
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send {
        async move {
            let row = self.to_rowlike()?;

            let tname = Self::table_name();

            let mut columns = vec![];

            let mut args: Vec<&(dyn ToSql + Sync)> = vec![];
            for (k, v) in row.iter() {
                columns.push(*k);
                args.push(v.as_sql());
            }
            let pairs = columns
                .into_iter()
                .enumerate()
                .map(|(i, c)| {
                    let v = i + 1;
                    format!("{c} = ${v}")
                })
                .join(", ");

            let id = self.id();

            let last = args.len() + 1;
            let q = format!("UPDATE {tname} SET {pairs} WHERE id = ${last};");

            args.push(&id);

            client.execute(q.as_str(), args.as_slice()).await?;
            Ok(())
        }
    }

    // Called by ExistingRow<T>; use the default impl.
    fn delete(
        self,
        client: &mut EasyTransaction<'_>,
        _t: Protect,
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send {
        async move {
            let tname = Self::table_name();
            let id = self.id();

            let q = format!("DELETE FROM {tname} WHERE id = $1;");

            client.execute(&q, &[&id]).await?;

            Ok(())
        }
    }
}

/// Prevents anyone from being able to accidentally call raw
/// DBTable::insert/update/delete; only constructable by the row wrappers.
pub struct Protect {
    #[allow(dead_code)]
    guard: (),
}

impl Protect {
    /// Intentionally not `pub`; do not add any other constructor that is.
    fn new() -> Self {
        Self { guard: () }
    }
}

pub struct ClientPair {
    client: Client,
}

impl std::ops::Deref for ClientPair {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl std::ops::DerefMut for ClientPair {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}

/// Connects to the metadata store named by a `postgres://` url.
pub async fn new_client(storage_url: &str) -> StorageResult<ClientPair> {
    let (client, conn) = tokio_postgres::connect(storage_url, NoTls)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

    tokio::spawn(async move {
        let conn_res = conn.await;

        tracing::trace!("Result from connection after resolution: {conn_res:?}");
    });

    Ok(ClientPair { client })
}

pub trait AsEasyTransaction {
    fn easy_transaction(
        &mut self,
    ) -> impl std::future::Future<Output = StorageResult<EasyTransaction<'_>>> + Send;
}

impl AsEasyTransaction for Client {
    async fn easy_transaction(&mut self) -> StorageResult<EasyTransaction<'_>> {
        let t = self.transaction().await?;
        Ok(EasyTransaction { inner: Some(t) })
    }
}

impl AsEasyTransaction for ClientPair {
    async fn easy_transaction(&mut self) -> StorageResult<EasyTransaction<'_>> {
        self.client.easy_transaction().await
    }
}

impl<'a> AsEasyTransaction for Transaction<'a> {
    async fn easy_transaction(&mut self) -> StorageResult<EasyTransaction<'_>> {
        Ok(EasyTransaction {
            inner: Some(self.transaction().await?),
        })
    }
}

pub struct EasyTransaction<'a> {
    inner: Option<Transaction<'a>>,
}

impl<'a> EasyTransaction<'a> {
    /// Take this transaction and roll it back, consuming the transaction in
    /// the process
    pub async fn rollback(mut self) -> StorageResult<()> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| StorageError::Other("no inner existed to roll back".to_owned()))?;

        inner.rollback().await?;

        Ok(())
    }

    /// Commit this transaction within the context
    ///
    /// NOTE: if this has been created itself *within* another transaction,
    /// then you must commit the outer transaction as well--otherwise this
    /// one will not apply even though you "committed" it!
    pub async fn commit(mut self) -> StorageResult<()> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| StorageError::Other("no inner existed to commit".to_owned()))?;

        inner.commit().await?;

        Ok(())
    }

    /// Create a nested transaction within this transaction
    pub async fn transaction(&mut self) -> StorageResult<EasyTransaction<'_>> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| StorageError::Other("no inner to take transaction from".to_owned()))?;
        let t = inner.transaction().await?;

        Ok(EasyTransaction { inner: Some(t) })
    }
}

// allow calling regular Transaction methods on an EasyTransaction
impl<'a> std::ops::Deref for EasyTransaction<'a> {
    type Target = Transaction<'a>;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().expect("transaction was already consumed")
    }
}

impl<'a> std::ops::DerefMut for EasyTransaction<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut().expect("transaction was already consumed")
    }
}

// Dropping an open transaction rolls it back; that is the intended path out
// of every error return, so only note it at trace level.
impl<'a> std::ops::Drop for EasyTransaction<'a> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::trace!("Dropping a transaction without committing it");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::ID;

    #[test]
    fn id_string_round_trip() {
        let id = ID::new();
        let s = id.to_string();
        assert_eq!(ID::from_str(&s).unwrap(), id);
    }

    #[test]
    fn nil_id_is_stable() {
        assert_eq!(
            ID::nil().to_string(),
            "00000000-0000-0000-0000-000000000000"
        );
    }
}
