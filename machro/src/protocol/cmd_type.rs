//! Column kinds, sql types and statement classes.
use std::fmt;

use crate::common::ByteStr;

/// Wire column kind, the high byte of the server column type word.
///
/// The low 2 bits are flags, `0b01` marks a variable length kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdType(pub u8);

const VAR: u8 = 0b01;
const TIME: u8 = 0b10;

impl CmdType {
    pub const VARCHAR: CmdType = CmdType(1 << 2 | VAR);
    pub const DATE: CmdType = CmdType(1 << 2 | TIME);
    pub const INT16: CmdType = CmdType(1 << 2);
    pub const INT32: CmdType = CmdType(2 << 2);
    pub const INT64: CmdType = CmdType(3 << 2);
    pub const FLT32: CmdType = CmdType(4 << 2);
    pub const FLT64: CmdType = CmdType(5 << 2);
    pub const NUL: CmdType = CmdType(6 << 2);
    pub const IPV4: CmdType = CmdType(8 << 2);
    pub const IPV6: CmdType = CmdType(9 << 2);
    pub const BOOL: CmdType = CmdType(10 << 2);
    pub const CHAR: CmdType = CmdType(11 << 2 | VAR);
    pub const TEXT: CmdType = CmdType(12 << 2 | VAR);
    pub const CLOB: CmdType = CmdType(13 << 2 | VAR);
    pub const BLOB: CmdType = CmdType(14 << 2 | VAR);
    pub const JSON: CmdType = CmdType(15 << 2 | VAR);
    pub const BINARY: CmdType = CmdType(24 << 2 | VAR);
    pub const IPNET: CmdType = CmdType(25 << 2 | VAR);
    pub const UINT16: CmdType = CmdType(26 << 2);
    pub const UINT32: CmdType = CmdType(27 << 2);
    pub const UINT64: CmdType = CmdType(28 << 2);

    /// Extract the kind from a 64 bit column type word.
    pub const fn from_type_word(word: u64) -> CmdType {
        CmdType((word >> 56) as u8)
    }

    pub const fn is_variable(self) -> bool {
        self.0 & VAR == VAR
    }

    /// Variable kinds decoded as text rather than bytes.
    pub const fn is_textual(self) -> bool {
        matches!(self, Self::VARCHAR | Self::TEXT | Self::CHAR | Self::JSON | Self::CLOB | Self::IPNET)
    }

    /// Byte length of a fixed column, variable kinds fall back to `precision`.
    pub const fn column_len(self, precision: u32) -> u32 {
        match self {
            Self::INT16 | Self::UINT16 | Self::BOOL => 2,
            Self::INT32 | Self::UINT32 | Self::FLT32 => 4,
            Self::INT64 | Self::UINT64 | Self::FLT64 | Self::DATE => 8,
            Self::IPV4 => 5,
            Self::IPV6 => 17,
            Self::NUL => 0,
            _ => precision,
        }
    }

    /// Sql type reported to callers, unsigned kinds widen into the signed tier.
    pub const fn sql_type(self) -> SqlType {
        match self {
            Self::BOOL | Self::INT16 | Self::UINT16 => SqlType::Int16,
            Self::INT32 | Self::UINT32 => SqlType::Int32,
            Self::INT64 | Self::UINT64 => SqlType::Int64,
            Self::DATE => SqlType::DateTime,
            Self::FLT32 => SqlType::Float,
            Self::FLT64 => SqlType::Double,
            Self::IPV4 => SqlType::Ipv4,
            Self::IPV6 => SqlType::Ipv6,
            Self::BINARY | Self::BLOB => SqlType::Binary,
            _ => SqlType::String,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::VARCHAR => "varchar",
            Self::DATE => "datetime",
            Self::INT16 => "short",
            Self::INT32 => "integer",
            Self::INT64 => "long",
            Self::FLT32 => "float",
            Self::FLT64 => "double",
            Self::NUL => "null",
            Self::IPV4 => "ipv4",
            Self::IPV6 => "ipv6",
            Self::BOOL => "boolean",
            Self::CHAR => "char",
            Self::TEXT => "text",
            Self::CLOB => "clob",
            Self::BLOB => "blob",
            Self::JSON => "json",
            Self::BINARY => "binary",
            Self::IPNET => "ipnet",
            Self::UINT16 => "ushort",
            Self::UINT32 => "uinteger",
            Self::UINT64 => "ulong",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Precision bits of a column type word.
pub const fn precision(word: u64) -> u32 {
    ((word >> 28) & 0x0fff_ffff) as u32
}

/// Scale bits of a column type word.
pub const fn scale(word: u64) -> u32 {
    (word & 0x0fff_ffff) as u32
}

/// Null sentinels of fixed kinds.
pub mod null {
    pub const INT16: u16 = 0x8000;
    pub const UINT16: u16 = 0xffff;
    pub const INT32: u32 = 0x8000_0000;
    pub const UINT32: u32 = 0xffff_ffff;
    pub const INT64: u64 = 0x8000_0000_0000_0000;
    pub const UINT64: u64 = u64::MAX;
    pub const DATETIME: u64 = u64::MAX;
    pub const FLOAT: f32 = f32::MAX;
    pub const DOUBLE: f64 = f64::MAX;
}

/// Sql type of a parameter or column as seen by callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SqlType {
    Int16 = 0,
    Int32 = 1,
    Int64 = 2,
    DateTime = 3,
    Float = 4,
    Double = 5,
    Ipv4 = 6,
    Ipv6 = 7,
    #[default]
    String = 8,
    Binary = 9,
}

impl SqlType {
    pub const fn cmd_type(self) -> CmdType {
        match self {
            SqlType::Int16 => CmdType::INT16,
            SqlType::Int32 => CmdType::INT32,
            SqlType::Int64 => CmdType::INT64,
            SqlType::DateTime => CmdType::DATE,
            SqlType::Float => CmdType::FLT32,
            SqlType::Double => CmdType::FLT64,
            SqlType::Ipv4 => CmdType::IPV4,
            SqlType::Ipv6 => CmdType::IPV6,
            SqlType::Binary => CmdType::BINARY,
            SqlType::String => CmdType::VARCHAR,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SqlType::Int16 => "INT16",
            SqlType::Int32 => "INT32",
            SqlType::Int64 => "INT64",
            SqlType::DateTime => "DATETIME",
            SqlType::Float => "FLOAT",
            SqlType::Double => "DOUBLE",
            SqlType::Ipv4 => "IPV4",
            SqlType::Ipv6 => "IPV6",
            SqlType::String => "STRING",
            SqlType::Binary => "BINARY",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Server statement class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StmtType(pub i32);

impl StmtType {
    pub const UNKNOWN: StmtType = StmtType(0);
    pub const DDL: StmtType = StmtType(1);
    pub const ALTER_SYSTEM: StmtType = StmtType(256);
    pub const SELECT: StmtType = StmtType(512);
    pub const INSERT: StmtType = StmtType(513);
    pub const DELETE: StmtType = StmtType(514);
    pub const INSERT_SELECT: StmtType = StmtType(519);
    pub const UPDATE: StmtType = StmtType(520);
    pub const EXEC_ROLLUP: StmtType = StmtType(522);

    pub const fn is_select(self) -> bool {
        self.0 == 512
    }

    pub const fn is_ddl(self) -> bool {
        matches!(self.0, 1..=255)
    }

    pub const fn is_alter_system(self) -> bool {
        matches!(self.0, 256..=511)
    }

    pub const fn is_insert(self) -> bool {
        self.0 == 513
    }

    pub const fn is_delete(self) -> bool {
        matches!(self.0, 514..=518)
    }

    pub const fn is_insert_select(self) -> bool {
        self.0 == 519
    }

    pub const fn is_update(self) -> bool {
        self.0 == 520
    }

    pub const fn is_exec_rollup(self) -> bool {
        matches!(self.0, 522..=524)
    }

    /// Classify by the leading keyword, used when the server omit the class.
    pub fn infer(sql: &str) -> StmtType {
        let sql = sql.trim().to_ascii_uppercase();
        let head = sql.split(' ').next().unwrap_or_default();
        match head {
            "SELECT" => Self::SELECT,
            "INSERT" if sql.contains("SELECT") => Self::INSERT_SELECT,
            "INSERT" => Self::INSERT,
            "DELETE" => Self::DELETE,
            "UPDATE" => Self::UPDATE,
            "ALTER" if sql.starts_with("ALTER SYSTEM") => Self::ALTER_SYSTEM,
            "ALTER" | "CREATE" | "DROP" | "TRUNCATE" => Self::DDL,
            "EXEC" => Self::EXEC_ROLLUP,
            _ => Self::UNKNOWN,
        }
    }
}

/// Result column metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: ByteStr,
    pub cmd_type: CmdType,
    pub precision: u32,
    pub scale: u32,
    /// Fixed byte length, or precision for variable kinds.
    pub length: u32,
    pub sql_type: SqlType,
    pub nullable: bool,
}

impl ColumnDesc {
    pub fn new(name: ByteStr, type_word: u64) -> ColumnDesc {
        let cmd_type = CmdType::from_type_word(type_word);
        let precision = precision(type_word);
        Self {
            name,
            cmd_type,
            precision,
            scale: scale(type_word),
            length: cmd_type.column_len(precision),
            sql_type: cmd_type.sql_type(),
            nullable: true,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.cmd_type.is_variable()
    }

    /// Display size, variable columns report their precision capped at 64K.
    pub fn size(&self) -> u32 {
        match self.is_variable() {
            true if self.length == 0 => self.precision.min(65536),
            true => self.length.min(65536),
            false => self.length,
        }
    }
}

/// Prepared statement parameter metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamDesc {
    pub sql_type: SqlType,
    pub precision: u32,
    pub scale: u32,
    pub nullable: bool,
}

impl ParamDesc {
    pub fn new(type_word: u64) -> ParamDesc {
        Self {
            sql_type: CmdType::from_type_word(type_word).sql_type(),
            precision: precision(type_word),
            scale: scale(type_word),
            nullable: true,
        }
    }
}

impl Default for ParamDesc {
    fn default() -> Self {
        Self { sql_type: SqlType::String, precision: 0, scale: 0, nullable: true }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn type_codes() {
        assert_eq!(CmdType::VARCHAR.0, 5);
        assert_eq!(CmdType::DATE.0, 6);
        assert_eq!(CmdType::INT32.0, 8);
        assert_eq!(CmdType::BOOL.0, 40);
        assert_eq!(CmdType::BINARY.0, 97);
        assert_eq!(CmdType::UINT64.0, 112);
        assert!(CmdType::CHAR.is_variable());
        assert!(!CmdType::DATE.is_variable());
        assert!(!CmdType::IPV6.is_variable());
    }

    #[test]
    fn type_word() {
        let word = (CmdType::VARCHAR.0 as u64) << 56 | 40 << 28 | 3;
        let col = ColumnDesc::new("NAME".into(), word);
        assert_eq!(col.cmd_type, CmdType::VARCHAR);
        assert_eq!((col.precision, col.scale, col.length), (40, 3, 40));
        assert_eq!(col.sql_type, SqlType::String);
        assert_eq!(col.size(), 40);

        let col = ColumnDesc::new("V".into(), (CmdType::UINT32.0 as u64) << 56);
        assert_eq!(col.length, 4);
        assert_eq!(col.sql_type, SqlType::Int32);

        let col = ColumnDesc::new("B".into(), (CmdType::BLOB.0 as u64) << 56 | 100_000 << 28);
        assert_eq!(col.sql_type, SqlType::Binary);
        assert_eq!(col.size(), 65536);

        assert_eq!(ParamDesc::new((CmdType::DATE.0 as u64) << 56).sql_type, SqlType::DateTime);
    }

    #[test]
    fn sql_type_map() {
        assert_eq!(SqlType::Int16.cmd_type(), CmdType::INT16);
        assert_eq!(SqlType::String.cmd_type(), CmdType::VARCHAR);
        assert_eq!(SqlType::Binary.cmd_type(), CmdType::BINARY);
        assert_eq!(CmdType::BOOL.sql_type(), SqlType::Int16);
        assert_eq!(CmdType::UINT64.sql_type(), SqlType::Int64);
        assert_eq!(CmdType::JSON.sql_type(), SqlType::String);
        assert_eq!(SqlType::DateTime.to_string(), "DATETIME");
    }

    #[test]
    fn infer_stmt_type() {
        assert_eq!(StmtType::infer("  select 1 from dual"), StmtType::SELECT);
        assert_eq!(StmtType::infer("insert into t values (?)"), StmtType::INSERT);
        assert_eq!(StmtType::infer("INSERT INTO t SELECT * FROM s"), StmtType::INSERT_SELECT);
        assert_eq!(StmtType::infer("delete from t"), StmtType::DELETE);
        assert_eq!(StmtType::infer("update t set v = 1"), StmtType::UPDATE);
        assert_eq!(StmtType::infer("alter system checkpoint"), StmtType::ALTER_SYSTEM);
        assert_eq!(StmtType::infer("alter table t add column (v int)"), StmtType::DDL);
        assert_eq!(StmtType::infer("create table t (v int)"), StmtType::DDL);
        assert_eq!(StmtType::infer("exec rollup_force"), StmtType::EXEC_ROLLUP);
        assert_eq!(StmtType::infer("explain select 1"), StmtType::UNKNOWN);
        assert_eq!(StmtType::infer(""), StmtType::UNKNOWN);

        assert!(StmtType(518).is_delete());
        assert!(StmtType(524).is_exec_rollup());
        assert!(StmtType(255).is_ddl() && !StmtType(256).is_ddl());
        assert!(StmtType(300).is_alter_system());
    }
}
