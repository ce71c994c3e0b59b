use dashmap::DashMap;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::BufferPoolManager;
use crate::catalog::{ColumnDef, ColumnMeta, DbMeta, IndexMeta, TableMeta};
use crate::config::DatabaseConfig;
use crate::error::{QuarryError, QuarryResult};
use crate::execution::{DeleteExecutor, IndexScanExecutor, SeqScanExecutor};
use crate::expression::{Condition, Value};
use crate::storage::disk_manager::DiskManager;
use crate::storage::heap::{HeapFile, Record};
use crate::storage::index::{BTreeIndex, IndexKeySchema};
use crate::storage::Rid;
use crate::transaction::{LockManager, Transaction, TransactionState};

const META_FILE: &str = "db.meta";
// reserved for the recovery component; the core never writes it
const LOG_FILE: &str = "db.log";

/// Engine session owning the pager, buffer pool, lock manager, catalog
/// and the open table/index handles. One database is one directory.
pub struct Database {
    root: PathBuf,
    name: String,
    meta: RwLock<DbMeta>,
    disk_manager: Arc<DiskManager>,
    buffer_pool: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    heaps: DashMap<String, Arc<HeapFile>>,
    indexes: DashMap<String, Arc<BTreeIndex>>,
    next_txn_id: AtomicU64,
}

impl Database {
    /// Create a new database directory with an empty catalog and the
    /// reserved log file.
    pub fn create(root: impl AsRef<Path>) -> QuarryResult<Database> {
        Self::create_with_config(root, DatabaseConfig::default())
    }

    pub fn create_with_config(
        root: impl AsRef<Path>,
        config: DatabaseConfig,
    ) -> QuarryResult<Database> {
        let root = root.as_ref().to_path_buf();
        let name = db_name(&root)?;
        if root.exists() {
            return Err(QuarryError::DatabaseExists(name));
        }
        fs::create_dir_all(&root)?;
        let meta = DbMeta::new(&name);
        fs::write(root.join(META_FILE), meta.encode())?;
        fs::write(root.join(LOG_FILE), b"")?;
        info!("created database {name}");
        Self::init(root, name, meta, config)
    }

    /// Open an existing database directory, restoring the catalog and
    /// reopening every table and index file.
    pub fn open(root: impl AsRef<Path>) -> QuarryResult<Database> {
        Self::open_with_config(root, DatabaseConfig::default())
    }

    pub fn open_with_config(
        root: impl AsRef<Path>,
        config: DatabaseConfig,
    ) -> QuarryResult<Database> {
        let root = root.as_ref().to_path_buf();
        let name = db_name(&root)?;
        if !root.exists() {
            return Err(QuarryError::DatabaseNotFound(name));
        }
        let meta = DbMeta::decode(&fs::read_to_string(root.join(META_FILE))?)?;
        info!("opened database {name}");
        Self::init(root, name, meta, config)
    }

    fn init(
        root: PathBuf,
        name: String,
        meta: DbMeta,
        config: DatabaseConfig,
    ) -> QuarryResult<Database> {
        let disk_manager = Arc::new(DiskManager::new());
        let buffer_pool = Arc::new(BufferPoolManager::new(
            config.buffer_pool.buffer_pool_size,
            disk_manager.clone(),
        ));
        let db = Database {
            heaps: DashMap::new(),
            indexes: DashMap::new(),
            lock_manager: Arc::new(LockManager::new()),
            next_txn_id: AtomicU64::new(1),
            meta: RwLock::new(meta),
            disk_manager,
            buffer_pool,
            root,
            name,
        };
        let tables: Vec<TableMeta> = db.meta.read().tables.values().cloned().collect();
        for table in tables {
            let file_id = db.disk_manager.open_file(db.root.join(table.file_name()))?;
            let heap = HeapFile::open(db.buffer_pool.clone(), file_id)?;
            db.heaps.insert(table.name.clone(), Arc::new(heap));
            for index in &table.indexes {
                let file_id = db.disk_manager.open_file(db.root.join(index.file_name()))?;
                let handle = BTreeIndex::open(db.buffer_pool.clone(), file_id)?;
                db.indexes.insert(index.name(), Arc::new(handle));
            }
        }
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_manager(&self) -> Arc<LockManager> {
        self.lock_manager.clone()
    }

    pub fn buffer_pool(&self) -> Arc<BufferPoolManager> {
        self.buffer_pool.clone()
    }

    /// Flush the catalog and every open file.
    pub fn close(&self) -> QuarryResult<()> {
        self.flush_meta()?;
        for heap in self.heaps.iter() {
            self.buffer_pool.flush_all_pages(heap.file_id())?;
        }
        for index in self.indexes.iter() {
            self.buffer_pool.flush_all_pages(index.file_id())?;
        }
        Ok(())
    }

    fn flush_meta(&self) -> QuarryResult<()> {
        fs::write(self.root.join(META_FILE), self.meta.read().encode())?;
        Ok(())
    }

    pub fn create_table(&self, name: &str, col_defs: &[ColumnDef]) -> QuarryResult<()> {
        check_identifier(name)?;
        if col_defs.is_empty() {
            return Err(QuarryError::Storage(format!(
                "table {name} needs at least one column"
            )));
        }
        if self.meta.read().tables.contains_key(name) {
            return Err(QuarryError::TableExists(name.to_string()));
        }

        let mut cols = Vec::with_capacity(col_defs.len());
        let mut offset = 0u32;
        for def in col_defs {
            check_identifier(&def.name)?;
            if cols.iter().any(|c: &ColumnMeta| c.name == def.name) {
                return Err(QuarryError::Storage(format!(
                    "duplicate column {} in table {name}",
                    def.name
                )));
            }
            let len = def.data_type.raw_len(def.len);
            if len == 0 {
                return Err(QuarryError::Storage(format!(
                    "column {} has zero length",
                    def.name
                )));
            }
            cols.push(ColumnMeta {
                table: name.to_string(),
                name: def.name.clone(),
                data_type: def.data_type,
                len,
                offset,
                indexed: false,
            });
            offset += len;
        }

        let table = TableMeta {
            name: name.to_string(),
            cols,
            indexes: Vec::new(),
        };
        let file_id = self.disk_manager.create_file(self.root.join(table.file_name()))?;
        let heap = HeapFile::create(self.buffer_pool.clone(), file_id, table.record_size())?;
        self.heaps.insert(name.to_string(), Arc::new(heap));
        self.meta.write().tables.insert(name.to_string(), table);
        self.flush_meta()?;
        debug!("created table {name}");
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> QuarryResult<()> {
        let table = self.meta.read().table(name)?.clone();
        for index in &table.indexes {
            self.remove_index_storage(index)?;
        }
        let heap = self.table_heap(name)?;
        self.buffer_pool.discard_file_pages(heap.file_id())?;
        self.disk_manager.close_file(heap.file_id())?;
        self.heaps.remove(name);
        self.disk_manager.remove_file(self.root.join(table.file_name()))?;
        self.meta.write().tables.remove(name);
        self.flush_meta()?;
        debug!("dropped table {name}");
        Ok(())
    }

    /// Create an index over existing rows. `order` overrides the
    /// default page-filling tree order (tests use small orders).
    pub fn create_index(
        &self,
        table_name: &str,
        col_names: &[&str],
        order: Option<u32>,
    ) -> QuarryResult<()> {
        if col_names.is_empty() {
            return Err(QuarryError::Storage("index needs at least one column".to_string()));
        }
        let index_meta = {
            let meta = self.meta.read();
            let table = meta.table(table_name)?;
            if table.index_meta(col_names).is_some() {
                return Err(QuarryError::IndexExists(format!(
                    "{}({})",
                    table_name,
                    col_names.join(", ")
                )));
            }
            let cols = col_names
                .iter()
                .map(|n| table.col(n).cloned())
                .collect::<QuarryResult<Vec<ColumnMeta>>>()?;
            IndexMeta {
                table: table_name.to_string(),
                col_names: col_names.iter().map(|s| s.to_string()).collect(),
                col_tot_len: cols.iter().map(|c| c.len).sum(),
                cols,
            }
        };

        let file_id = self
            .disk_manager
            .create_file(self.root.join(index_meta.file_name()))?;
        let key_schema = IndexKeySchema::new(index_meta.key_types(), index_meta.key_lens());
        let index = Arc::new(BTreeIndex::create(
            self.buffer_pool.clone(),
            file_id,
            key_schema,
            order,
        )?);

        // back-fill from the rows already in the heap
        let heap = self.table_heap(table_name)?;
        let mut scan = crate::storage::heap::HeapScan::new(heap.clone())?;
        while let Some(rid) = scan.rid() {
            let record = heap.get_record(rid)?;
            index.insert_entry(&index_meta.key_from_record(&record.data), rid)?;
            scan.next()?;
        }

        self.indexes.insert(index_meta.name(), index);
        {
            let mut meta = self.meta.write();
            let table = meta.table_mut(table_name)?;
            for col in table.cols.iter_mut() {
                if index_meta.col_names.contains(&col.name) {
                    col.indexed = true;
                }
            }
            table.indexes.push(index_meta);
        }
        self.flush_meta()?;
        debug!("created index on {}({})", table_name, col_names.join(", "));
        Ok(())
    }

    pub fn drop_index(&self, table_name: &str, col_names: &[&str]) -> QuarryResult<()> {
        let index_meta = self
            .meta
            .read()
            .table(table_name)?
            .index_meta(col_names)
            .cloned()
            .ok_or_else(|| {
                QuarryError::IndexNotFound(format!("{}({})", table_name, col_names.join(", ")))
            })?;
        self.remove_index_storage(&index_meta)?;
        {
            let mut meta = self.meta.write();
            let table = meta.table_mut(table_name)?;
            table.indexes.retain(|i| i.name() != index_meta.name());
            // a column stays flagged while any surviving index uses it
            for col in table.cols.iter_mut() {
                col.indexed = table
                    .indexes
                    .iter()
                    .any(|i| i.col_names.contains(&col.name));
            }
        }
        self.flush_meta()?;
        Ok(())
    }

    fn remove_index_storage(&self, index_meta: &IndexMeta) -> QuarryResult<()> {
        let handle = self.index_handle(index_meta)?;
        self.buffer_pool.discard_file_pages(handle.file_id())?;
        self.disk_manager.close_file(handle.file_id())?;
        self.indexes.remove(&index_meta.name());
        self.disk_manager
            .remove_file(self.root.join(index_meta.file_name()))?;
        Ok(())
    }

    pub fn table_meta(&self, name: &str) -> QuarryResult<TableMeta> {
        Ok(self.meta.read().table(name)?.clone())
    }

    pub fn table_heap(&self, name: &str) -> QuarryResult<Arc<HeapFile>> {
        self.heaps
            .get(name)
            .map(|h| h.clone())
            .ok_or_else(|| QuarryError::TableNotFound(name.to_string()))
    }

    fn index_handle(&self, index_meta: &IndexMeta) -> QuarryResult<Arc<BTreeIndex>> {
        self.indexes
            .get(&index_meta.name())
            .map(|i| i.clone())
            .ok_or_else(|| QuarryError::IndexNotFound(index_meta.name()))
    }

    /// Index handles of a table in catalog order, paired with the
    /// table's index metadata by position.
    pub fn table_indexes(&self, name: &str) -> QuarryResult<Vec<Arc<BTreeIndex>>> {
        let table = self.table_meta(name)?;
        table
            .indexes
            .iter()
            .map(|meta| self.index_handle(meta))
            .collect()
    }

    /// Encode and insert one row, maintaining every index of the table.
    /// The caller's transaction takes write-intent locks first.
    pub fn insert_row(
        &self,
        txn: &Transaction,
        table_name: &str,
        values: &[Value],
    ) -> QuarryResult<Rid> {
        let table = self.table_meta(table_name)?;
        if values.len() != table.cols.len() {
            return Err(QuarryError::Execution(format!(
                "table {} has {} columns, got {} values",
                table_name,
                table.cols.len(),
                values.len()
            )));
        }
        let mut data = Vec::with_capacity(table.record_size() as usize);
        for (col, value) in table.cols.iter().zip(values.iter()) {
            if value.data_type() != col.data_type {
                return Err(QuarryError::TypeMismatch(format!(
                    "column {} is {}, got {}",
                    col.name,
                    col.data_type,
                    value.data_type()
                )));
            }
            data.extend(value.to_raw(col.len)?);
        }

        let heap = self.table_heap(table_name)?;
        self.lock_manager
            .lock_intention_exclusive_on_table(txn, heap.file_id())?;
        let rid = heap.insert_record(&data)?;
        self.lock_manager
            .lock_exclusive_on_record(txn, heap.file_id(), rid)?;
        for (meta, index) in table.indexes.iter().zip(self.table_indexes(table_name)?) {
            index.insert_entry(&meta.key_from_record(&data), rid)?;
        }
        Ok(rid)
    }

    /// Decode a row image into typed values, column by column.
    pub fn decode_row(&self, table_name: &str, record: &Record) -> QuarryResult<Vec<Value>> {
        let table = self.table_meta(table_name)?;
        table
            .cols
            .iter()
            .map(|col| {
                Value::from_raw(
                    col.data_type,
                    &record.data[col.offset as usize..(col.offset + col.len) as usize],
                )
            })
            .collect()
    }

    pub fn begin_transaction(&self) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Arc::new(Transaction::new(id))
    }

    /// Release the whole lock set and settle the deletion set.
    pub fn commit(&self, txn: &Transaction) {
        self.lock_manager.release_all(txn);
        let freed = txn.take_freed_index_pages();
        if !freed.is_empty() {
            debug!("txn {} reclaimed {} index pages", txn.id(), freed.len());
        }
        txn.set_state(TransactionState::Committed);
    }

    pub fn abort(&self, txn: &Transaction) {
        self.lock_manager.release_all(txn);
        txn.take_freed_index_pages();
        txn.set_state(TransactionState::Aborted);
    }

    /// Build a sequential-scan operator over a table.
    pub fn seq_scan_executor(
        &self,
        table_name: &str,
        conds: Vec<Condition>,
    ) -> QuarryResult<SeqScanExecutor> {
        let table = self.table_meta(table_name)?;
        Ok(SeqScanExecutor::new(
            self.table_heap(table_name)?,
            table.cols,
            conds,
        ))
    }

    /// Build an index-scan operator over the index on `col_names`.
    pub fn index_scan_executor(
        &self,
        table_name: &str,
        col_names: &[&str],
        conds: Vec<Condition>,
    ) -> QuarryResult<IndexScanExecutor> {
        let table = self.table_meta(table_name)?;
        let index_meta = table.index_meta(col_names).cloned().ok_or_else(|| {
            QuarryError::IndexNotFound(format!("{}({})", table_name, col_names.join(", ")))
        })?;
        let index = self.index_handle(&index_meta)?;
        IndexScanExecutor::new(
            self.table_heap(table_name)?,
            index,
            index_meta,
            table_name,
            table.cols,
            conds,
        )
    }

    /// Build a delete operator for pre-computed rids.
    pub fn delete_executor(
        &self,
        table_name: &str,
        conds: Vec<Condition>,
        rids: Vec<Rid>,
    ) -> QuarryResult<DeleteExecutor> {
        let table = self.table_meta(table_name)?;
        let indexes = self.table_indexes(table_name)?;
        Ok(DeleteExecutor::new(
            self.table_heap(table_name)?,
            table,
            indexes,
            conds,
            rids,
        ))
    }
}

fn db_name(root: &Path) -> QuarryResult<String> {
    root.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| QuarryError::Internal(format!("bad database path {}", root.display())))
}

fn check_identifier(name: &str) -> QuarryResult<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(QuarryError::Storage(format!(
            "identifier {name:?} is empty or contains whitespace"
        )));
    }
    Ok(())
}
