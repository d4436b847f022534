//! Key-value condition bag (C1): the ordered set of options carried on
//! every API request (spec §3, §4.1).

/// Closed set of condition keywords this core recognizes (spec §6 table).
/// Unknown keywords are still representable and forwarded — see
/// [`ConditionBag::add_raw`] — callers must never silently drop them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Keyword {
    ForceFlag,
    All,
    ReplNum,
    RescName,
    DestRescName,
    BackupRescName,
    DataType,
    FilePath,
    VerifyChksum,
    ForceChksum,
    PurgeStructFileCache,
    CollectionType,
    NativeNetcdfCall,
    TranslatedPath,
    IrodsAdmin,
}

impl Keyword {
    fn as_str(&self) -> &'static str {
        match self {
            Keyword::ForceFlag => "FORCE_FLAG",
            Keyword::All => "ALL",
            Keyword::ReplNum => "REPL_NUM",
            Keyword::RescName => "RESC_NAME",
            Keyword::DestRescName => "DEST_RESC_NAME",
            Keyword::BackupRescName => "BACKUP_RESC_NAME",
            Keyword::DataType => "DATA_TYPE",
            Keyword::FilePath => "FILE_PATH",
            Keyword::VerifyChksum => "VERIFY_CHKSUM",
            Keyword::ForceChksum => "FORCE_CHKSUM",
            Keyword::PurgeStructFileCache => "PURGE_STRUCT_FILE_CACHE",
            Keyword::CollectionType => "COLLECTION_TYPE",
            Keyword::NativeNetcdfCall => "NATIVE_NETCDF_CALL",
            Keyword::TranslatedPath => "TRANSLATED_PATH",
            Keyword::IrodsAdmin => "IRODS_ADMIN",
        }
    }
}

/// Ordered key-value bag of request options (spec §3 "Key-value condition
/// bag"). Insertion order matters only for logging; lookup/remove are keyed
/// on keyword identity and a keyword is never duplicated (`add` replaces).
///
/// Unknown (unrecognized) keywords are preserved verbatim via
/// [`ConditionBag::add_raw`]/[`ConditionBag::lookup_raw`] so a forwarding
/// hop never drops something it doesn't understand.
#[derive(Debug, Clone, Default)]
pub struct ConditionBag {
    entries: Vec<(String, String)>,
}

impl ConditionBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a well-known keyword, replacing any existing value.
    pub fn add(&mut self, keyword: Keyword, value: impl Into<String>) {
        self.add_raw(keyword.as_str(), value);
    }

    /// Sets a flag (empty-string value means "present").
    pub fn add_flag(&mut self, keyword: Keyword) {
        self.add(keyword, "");
    }

    /// Adds a raw keyword, known or not, replacing any existing value.
    pub fn add_raw(&mut self, keyword: impl Into<String>, value: impl Into<String>) {
        let keyword = keyword.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == keyword) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((keyword, value)),
        }
    }

    /// Looks up a well-known keyword's value. Returns `None` if not set.
    pub fn lookup(&self, keyword: Keyword) -> Option<&str> {
        self.lookup_raw(keyword.as_str())
    }

    pub fn lookup_raw(&self, keyword: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == keyword).map(|(_, v)| v.as_str())
    }

    /// True if the keyword is present, regardless of its value (flag
    /// semantics: empty-string value still counts as present).
    pub fn has(&self, keyword: Keyword) -> bool {
        self.lookup(keyword).is_some()
    }

    pub fn remove(&mut self, keyword: Keyword) -> Option<String> {
        self.remove_raw(keyword.as_str())
    }

    pub fn remove_raw(&mut self, keyword: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == keyword)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
