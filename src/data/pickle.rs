//! Python pickle 形式のデコーダ
//!
//! 交通標識データセットは `{"features": ndarray, "labels": ndarray}` 形式の
//! pickle ファイルで配布されています。ここでは numpy 配列の復元に必要な範囲の
//! pickle 仮想マシン（プロトコル 2〜5）を実装します。
//!
//! memo には値のスナップショットを保存します。memo 登録後に変更されたコンテナを
//! 後から参照するストリームは想定していません（numpy の pickle では発生しない）。
//! バイト列は `Arc<[u8]>` で共有するため、memo 登録でデータがコピーされることはありません。

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// pickle デコード時のエラー
#[derive(Debug, Error)]
pub enum PickleError {
    #[error("pickle データが途中で終わっています (offset {0})")]
    Truncated(usize),
    #[error("未対応のオペコード 0x{opcode:02x} (offset {offset})")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("スタックが空です (offset {0})")]
    StackUnderflow(usize),
    #[error("MARK が見つかりません (offset {0})")]
    MissingMark(usize),
    #[error("memo キー {0} は未登録です")]
    BadMemo(u32),
    #[error("numpy 配列の状態が不正です: {0}")]
    MalformedArray(String),
    #[error("未対応の dtype: {0}")]
    UnsupportedDtype(String),
    #[error("不正な値: {0}")]
    InvalidValue(String),
    #[error("STOP に到達する前にストリームが終了しました")]
    MissingStop,
}

pub type Result<T> = std::result::Result<T, PickleError>;

// オペコード
const PROTO: u8 = 0x80;
const FRAME: u8 = 0x95;
const STOP: u8 = b'.';
const MARK: u8 = b'(';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const NONE: u8 = b'N';
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const BINFLOAT: u8 = b'G';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const BINUNICODE: u8 = b'X';
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';
const BINBYTES8: u8 = 0x8e;
const BYTEARRAY8: u8 = 0x96;
const EMPTY_TUPLE: u8 = b')';
const TUPLE: u8 = b't';
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const EMPTY_LIST: u8 = b']';
const LIST: u8 = b'l';
const APPEND: u8 = b'a';
const APPENDS: u8 = b'e';
const EMPTY_DICT: u8 = b'}';
const DICT: u8 = b'd';
const SETITEM: u8 = b's';
const SETITEMS: u8 = b'u';
const EMPTY_SET: u8 = 0x8f;
const ADDITEMS: u8 = 0x90;
const FROZENSET: u8 = 0x91;
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const MEMOIZE: u8 = 0x94;
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const GLOBAL: u8 = b'c';
const STACK_GLOBAL: u8 = 0x93;
const REDUCE: u8 = b'R';
const BUILD: u8 = b'b';
const NEWOBJ: u8 = 0x81;
const NEWOBJ_EX: u8 = 0x92;

/// numpy 配列要素の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    Int,
    UInt,
    Float,
}

/// numpy dtype（`u1`, `<i8`, `f4` など）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    pub kind: ScalarKind,
    /// 要素のバイト数
    pub size: usize,
    pub big_endian: bool,
}

impl Dtype {
    /// dtype 記述子を解析する
    ///
    /// 先頭のバイトオーダー文字（`<`, `>`, `|`, `=`）は省略可能です。
    pub fn parse(descr: &str) -> Result<Self> {
        let unsupported = || PickleError::UnsupportedDtype(descr.to_string());

        let (big_endian, body) = match descr.as_bytes().first() {
            Some(b'>') => (true, &descr[1..]),
            Some(b'<') | Some(b'|') | Some(b'=') => (false, &descr[1..]),
            _ => (false, descr),
        };

        let mut chars = body.chars();
        let kind = match chars.next() {
            Some('b') => ScalarKind::Bool,
            Some('i') => ScalarKind::Int,
            Some('u') => ScalarKind::UInt,
            Some('f') => ScalarKind::Float,
            _ => return Err(unsupported()),
        };
        let size: usize = chars.as_str().parse().map_err(|_| unsupported())?;

        let valid = match kind {
            ScalarKind::Bool => size == 1,
            ScalarKind::Int | ScalarKind::UInt => matches!(size, 1 | 2 | 4 | 8),
            ScalarKind::Float => matches!(size, 4 | 8),
        };
        if !valid {
            return Err(unsupported());
        }

        Ok(Self { kind, size, big_endian })
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind, ScalarKind::Bool | ScalarKind::Int | ScalarKind::UInt)
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let order = if self.size == 1 {
            '|'
        } else if self.big_endian {
            '>'
        } else {
            '<'
        };
        let kind = match self.kind {
            ScalarKind::Bool => 'b',
            ScalarKind::Int => 'i',
            ScalarKind::UInt => 'u',
            ScalarKind::Float => 'f',
        };
        write!(f, "{}{}{}", order, kind, self.size)
    }
}

/// pickle 内の dtype 記述子
///
/// 未対応の dtype（`<U4`, `O`, `f2` など）は記述子のまま保持し、
/// 値を取り出すときに [`PickleError::UnsupportedDtype`] を返します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtypeDescr {
    Known(Dtype),
    Unsupported(String),
}

impl DtypeDescr {
    fn parse(descr: &str) -> Self {
        match Dtype::parse(descr) {
            Ok(dtype) => Self::Known(dtype),
            Err(_) => Self::Unsupported(descr.to_string()),
        }
    }

    pub fn dtype(&self) -> Result<Dtype> {
        match self {
            Self::Known(dtype) => Ok(*dtype),
            Self::Unsupported(descr) => Err(PickleError::UnsupportedDtype(descr.clone())),
        }
    }
}

/// shape の要素数（オーバーフロー時はエラー）
fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| PickleError::MalformedArray(format!("shape {:?} の要素数が大きすぎます", shape)))
}

fn empty_bytes() -> Arc<[u8]> {
    Arc::from(Vec::<u8>::new())
}

/// pickle から復元された numpy 配列（生バイト列を保持）
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub descr: DtypeDescr,
    pub fortran_order: bool,
    pub data: Arc<[u8]>,
}

impl NdArray {
    fn new(shape: Vec<usize>, descr: DtypeDescr, fortran_order: bool, data: Arc<[u8]>) -> Result<Self> {
        let count = element_count(&shape)?;
        if let DtypeDescr::Known(dtype) = &descr {
            let expected = count.checked_mul(dtype.size).ok_or_else(|| {
                PickleError::MalformedArray(format!("shape {:?} のバイト数が大きすぎます", shape))
            })?;
            if data.len() != expected {
                return Err(PickleError::MalformedArray(format!(
                    "データ長 {} バイトが shape {:?} / dtype {} と一致しません (期待: {})",
                    data.len(),
                    shape,
                    dtype,
                    expected
                )));
            }
        }
        Ok(Self { shape, descr, fortran_order, data })
    }

    /// 要素の dtype（未対応の dtype ならエラー）
    pub fn dtype(&self) -> Result<Dtype> {
        self.descr.dtype()
    }

    /// 要素数
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// `u1` 配列を C 順序のバイト列として取り出す
    pub fn to_u8(&self) -> Result<Vec<u8>> {
        let dtype = self.dtype()?;
        if dtype.kind != ScalarKind::UInt || dtype.size != 1 {
            return Err(PickleError::InvalidValue(format!(
                "u1 配列が必要ですが dtype は {} です",
                dtype
            )));
        }
        Ok(self.c_order_bytes(dtype.size).into_owned())
    }

    /// 整数（または bool）配列を i64 として取り出す
    pub fn to_i64(&self) -> Result<Vec<i64>> {
        let dtype = self.dtype()?;
        if !dtype.is_integer() {
            return Err(PickleError::InvalidValue(format!(
                "整数配列が必要ですが dtype は {} です",
                dtype
            )));
        }

        let size = dtype.size;
        let bytes = self.c_order_bytes(size);
        let values = bytes
            .chunks_exact(size)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                if dtype.big_endian {
                    for (dst, src) in buf.iter_mut().zip(chunk.iter().rev()) {
                        *dst = *src;
                    }
                } else {
                    buf[..size].copy_from_slice(chunk);
                }
                // 符号拡張
                if dtype.kind == ScalarKind::Int && size < 8 && buf[size - 1] & 0x80 != 0 {
                    for b in buf.iter_mut().skip(size) {
                        *b = 0xff;
                    }
                }
                i64::from_le_bytes(buf)
            })
            .collect();

        Ok(values)
    }

    /// Fortran 順序の配列を C 順序に並び替える
    fn c_order_bytes(&self, item: usize) -> Cow<'_, [u8]> {
        if !self.fortran_order || self.ndim() < 2 {
            return Cow::Borrowed(&self.data[..]);
        }

        let ndim = self.ndim();
        let mut f_strides = vec![1usize; ndim];
        for d in 1..ndim {
            f_strides[d] = f_strides[d - 1] * self.shape[d - 1];
        }

        let mut out = vec![0u8; self.data.len()];
        let mut index = vec![0usize; ndim];
        for c in 0..self.len() {
            let f: usize = index.iter().zip(&f_strides).map(|(i, s)| i * s).sum();
            out[c * item..(c + 1) * item].copy_from_slice(&self.data[f * item..(f + 1) * item]);

            for d in (0..ndim).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }

        Cow::Owned(out)
    }
}

/// `module.name` 形式のグローバル参照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub module: String,
    pub name: String,
}

impl Global {
    fn is(&self, modules: &[&str], name: &str) -> bool {
        self.name == name && modules.contains(&self.module.as_str())
    }

    fn is_reconstruct(&self) -> bool {
        self.is(&["numpy.core.multiarray", "numpy._core.multiarray"], "_reconstruct")
    }

    fn is_frombuffer(&self) -> bool {
        self.is(&["numpy.core.numeric", "numpy._core.numeric"], "_frombuffer")
    }

    fn is_dtype(&self) -> bool {
        self.is(&["numpy"], "dtype")
    }
}

/// デコードされた pickle の値
#[derive(Debug, Clone, PartialEq)]
pub enum PickleValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Arc<[u8]>),
    List(Vec<PickleValue>),
    Tuple(Vec<PickleValue>),
    Dict(Vec<(PickleValue, PickleValue)>),
    Global(Global),
    Dtype(DtypeDescr),
    Array(NdArray),
    /// `_reconstruct` 直後で BUILD 待ちの配列
    PendingArray,
    /// 未知のクラスのインスタンス
    Object { class: Global, args: Vec<PickleValue> },
}

impl PickleValue {
    /// 文字列キーで辞書を引く（Python 2 の str キーも対象）
    pub fn get(&self, key: &str) -> Option<&PickleValue> {
        match self {
            PickleValue::Dict(items) => items
                .iter()
                .find(|(k, _)| k.as_text().as_deref() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// 辞書のキー一覧（文字列キーのみ）
    pub fn keys(&self) -> Vec<String> {
        match self {
            PickleValue::Dict(items) => items
                .iter()
                .filter_map(|(k, _)| k.as_text().map(|s| s.into_owned()))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            PickleValue::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            PickleValue::String(s) => Some(Cow::Borrowed(s.as_str())),
            PickleValue::Bytes(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            PickleValue::Int(v) => Some(*v),
            PickleValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            PickleValue::None => "None",
            PickleValue::Bool(_) => "bool",
            PickleValue::Int(_) => "int",
            PickleValue::Float(_) => "float",
            PickleValue::String(_) => "str",
            PickleValue::Bytes(_) => "bytes",
            PickleValue::List(_) => "list",
            PickleValue::Tuple(_) => "tuple",
            PickleValue::Dict(_) => "dict",
            PickleValue::Global(_) => "global",
            PickleValue::Dtype(_) => "numpy.dtype",
            PickleValue::Array(_) => "numpy.ndarray",
            PickleValue::PendingArray => "numpy.ndarray (未構築)",
            PickleValue::Object { .. } => "object",
        }
    }
}

/// pickle バイト列をデコードする
pub fn from_slice(bytes: &[u8]) -> Result<PickleValue> {
    Unpickler::new(bytes).load()
}

struct Unpickler<'a> {
    input: &'a [u8],
    pos: usize,
    stack: Vec<PickleValue>,
    marks: Vec<usize>,
    memo: HashMap<u32, PickleValue>,
}

impl<'a> Unpickler<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn load(mut self) -> Result<PickleValue> {
        while self.pos < self.input.len() {
            let offset = self.pos;
            let opcode = self.read_u8()?;

            match opcode {
                PROTO => {
                    self.read_u8()?;
                }
                FRAME => {
                    self.read_u64()?;
                }
                STOP => return self.pop(),
                MARK => self.marks.push(self.stack.len()),
                POP => {
                    self.pop()?;
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                DUP => {
                    let top = self.stack.last().cloned().ok_or(PickleError::StackUnderflow(offset))?;
                    self.stack.push(top);
                }

                NONE => self.stack.push(PickleValue::None),
                NEWTRUE => self.stack.push(PickleValue::Bool(true)),
                NEWFALSE => self.stack.push(PickleValue::Bool(false)),
                BININT => {
                    let v = i32::from_le_bytes(self.read_array::<4>()?);
                    self.stack.push(PickleValue::Int(v as i64));
                }
                BININT1 => {
                    let v = self.read_u8()?;
                    self.stack.push(PickleValue::Int(v as i64));
                }
                BININT2 => {
                    let v = u16::from_le_bytes(self.read_array::<2>()?);
                    self.stack.push(PickleValue::Int(v as i64));
                }
                LONG1 => {
                    let n = self.read_u8()? as usize;
                    let v = self.read_long(n)?;
                    self.stack.push(PickleValue::Int(v));
                }
                LONG4 => {
                    let n = self.read_u32()? as usize;
                    let v = self.read_long(n)?;
                    self.stack.push(PickleValue::Int(v));
                }
                BINFLOAT => {
                    let v = f64::from_be_bytes(self.read_array::<8>()?);
                    self.stack.push(PickleValue::Float(v));
                }

                BINUNICODE | SHORT_BINUNICODE | BINUNICODE8 => {
                    let n = match opcode {
                        SHORT_BINUNICODE => self.read_u8()? as usize,
                        BINUNICODE => self.read_u32()? as usize,
                        _ => self.read_u64()? as usize,
                    };
                    let raw = self.read_bytes(n)?;
                    let s = std::str::from_utf8(raw)
                        .map_err(|e| PickleError::InvalidValue(format!("UTF-8 ではない文字列: {}", e)))?;
                    self.stack.push(PickleValue::String(s.to_string()));
                }
                // Python 2 の str はバイト列として扱う
                BINSTRING | SHORT_BINSTRING | BINBYTES | SHORT_BINBYTES | BINBYTES8 | BYTEARRAY8 => {
                    let n = match opcode {
                        SHORT_BINSTRING | SHORT_BINBYTES => self.read_u8()? as usize,
                        BINSTRING => {
                            let n = i32::from_le_bytes(self.read_array::<4>()?);
                            usize::try_from(n)
                                .map_err(|_| PickleError::InvalidValue(format!("負の文字列長: {}", n)))?
                        }
                        BINBYTES => self.read_u32()? as usize,
                        _ => self.read_u64()? as usize,
                    };
                    let raw = self.read_bytes(n)?;
                    self.stack.push(PickleValue::Bytes(Arc::from(raw)));
                }

                EMPTY_TUPLE => self.stack.push(PickleValue::Tuple(Vec::new())),
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(PickleValue::Tuple(items));
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let n = (opcode - TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(PickleError::StackUnderflow(offset));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(PickleValue::Tuple(items));
                }
                EMPTY_LIST => self.stack.push(PickleValue::List(Vec::new())),
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(PickleValue::List(items));
                }
                APPEND => {
                    let value = self.pop()?;
                    self.extend_top(vec![value], offset)?;
                }
                APPENDS | ADDITEMS => {
                    let items = self.pop_mark()?;
                    self.extend_top(items, offset)?;
                }
                EMPTY_SET => self.stack.push(PickleValue::List(Vec::new())),
                FROZENSET => {
                    let items = self.pop_mark()?;
                    self.stack.push(PickleValue::List(items));
                }
                EMPTY_DICT => self.stack.push(PickleValue::Dict(Vec::new())),
                DICT => {
                    let items = self.pop_mark()?;
                    let pairs = into_pairs(items)?;
                    self.stack.push(PickleValue::Dict(pairs));
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.insert_top(vec![(key, value)], offset)?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = into_pairs(items)?;
                    self.insert_top(pairs, offset)?;
                }

                BINPUT => {
                    let key = self.read_u8()? as u32;
                    self.memoize(key, offset)?;
                }
                LONG_BINPUT => {
                    let key = self.read_u32()?;
                    self.memoize(key, offset)?;
                }
                MEMOIZE => {
                    let key = self.memo.len() as u32;
                    self.memoize(key, offset)?;
                }
                BINGET | LONG_BINGET => {
                    let key = if opcode == BINGET {
                        self.read_u8()? as u32
                    } else {
                        self.read_u32()?
                    };
                    let value = self.memo.get(&key).cloned().ok_or(PickleError::BadMemo(key))?;
                    self.stack.push(value);
                }

                GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(PickleValue::Global(Global { module, name }));
                }
                STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module.as_text(), name.as_text()) {
                        (Some(module), Some(name)) => {
                            let global = Global {
                                module: module.into_owned(),
                                name: name.into_owned(),
                            };
                            self.stack.push(PickleValue::Global(global));
                        }
                        _ => {
                            return Err(PickleError::InvalidValue(
                                "STACK_GLOBAL の引数が文字列ではありません".to_string(),
                            ))
                        }
                    }
                }
                REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = reduce(callable, args)?;
                    self.stack.push(value);
                }
                NEWOBJ => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.stack.push(new_object(class, args)?);
                }
                NEWOBJ_EX => {
                    let _kwargs = self.pop()?;
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.stack.push(new_object(class, args)?);
                }
                BUILD => {
                    let state = self.pop()?;
                    let target = self.pop()?;
                    self.stack.push(build(target, state)?);
                }

                _ => return Err(PickleError::UnknownOpcode { opcode, offset }),
            }
        }

        Err(PickleError::MissingStop)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.input.get(self.pos).ok_or(PickleError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(PickleError::Truncated(self.pos))?;
        let slice = self.input.get(self.pos..end).ok_or(PickleError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_bytes(N)?);
        Ok(buf)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }

    /// リトルエンディアン 2 の補数表現の整数（8 バイトまで）
    fn read_long(&mut self, n: usize) -> Result<i64> {
        if n > 8 {
            return Err(PickleError::InvalidValue(format!("{} バイトの整数は扱えません", n)));
        }
        let raw = self.read_bytes(n)?;
        if n == 0 {
            return Ok(0);
        }
        let fill = if raw[n - 1] & 0x80 != 0 { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        buf[..n].copy_from_slice(raw);
        Ok(i64::from_le_bytes(buf))
    }

    fn read_line(&mut self) -> Result<String> {
        let rest = &self.input[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::Truncated(self.input.len()))?;
        let line = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(line)
    }

    fn pop(&mut self) -> Result<PickleValue> {
        // MARK より下の値は取り出さない
        if let Some(&mark) = self.marks.last() {
            if self.stack.len() <= mark {
                return Err(PickleError::StackUnderflow(self.pos));
            }
        }
        self.stack.pop().ok_or(PickleError::StackUnderflow(self.pos))
    }

    fn pop_mark(&mut self) -> Result<Vec<PickleValue>> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(self.pos))?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow(self.pos));
        }
        Ok(self.stack.split_off(mark))
    }

    fn memoize(&mut self, key: u32, offset: usize) -> Result<()> {
        let top = self.stack.last().cloned().ok_or(PickleError::StackUnderflow(offset))?;
        self.memo.insert(key, top);
        Ok(())
    }

    fn extend_top(&mut self, items: Vec<PickleValue>, offset: usize) -> Result<()> {
        match self.stack.last_mut() {
            Some(PickleValue::List(list)) => {
                list.extend(items);
                Ok(())
            }
            Some(other) => Err(PickleError::InvalidValue(format!(
                "{} に要素を追加できません",
                other.type_name()
            ))),
            None => Err(PickleError::StackUnderflow(offset)),
        }
    }

    fn insert_top(&mut self, pairs: Vec<(PickleValue, PickleValue)>, offset: usize) -> Result<()> {
        match self.stack.last_mut() {
            Some(PickleValue::Dict(dict)) => {
                for (key, value) in pairs {
                    match dict.iter_mut().find(|(k, _)| *k == key) {
                        Some(slot) => slot.1 = value,
                        None => dict.push((key, value)),
                    }
                }
                Ok(())
            }
            // 未知のオブジェクトへの SETITEM は無視する
            Some(PickleValue::Object { .. }) => Ok(()),
            Some(other) => Err(PickleError::InvalidValue(format!(
                "{} にキーを設定できません",
                other.type_name()
            ))),
            None => Err(PickleError::StackUnderflow(offset)),
        }
    }
}

fn into_pairs(items: Vec<PickleValue>) -> Result<Vec<(PickleValue, PickleValue)>> {
    if items.len() % 2 != 0 {
        return Err(PickleError::InvalidValue(format!(
            "キーと値の数が一致しません ({} 要素)",
            items.len()
        )));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn tuple_items(value: PickleValue, what: &str) -> Result<Vec<PickleValue>> {
    match value {
        PickleValue::Tuple(items) | PickleValue::List(items) => Ok(items),
        other => Err(PickleError::InvalidValue(format!(
            "{} にはタプルが必要ですが {} でした",
            what,
            other.type_name()
        ))),
    }
}

fn parse_shape(value: &PickleValue) -> Result<Vec<usize>> {
    let items = match value {
        PickleValue::Tuple(items) | PickleValue::List(items) => items,
        // 0 次元配列の shape は () だが、整数単体も許容する
        PickleValue::Int(n) => {
            return usize::try_from(*n)
                .map(|n| vec![n])
                .map_err(|_| PickleError::MalformedArray(format!("負の次元: {}", n)))
        }
        other => {
            return Err(PickleError::MalformedArray(format!(
                "shape がタプルではありません ({})",
                other.type_name()
            )))
        }
    };

    items
        .iter()
        .map(|item| {
            item.as_int()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| PickleError::MalformedArray(format!("不正な次元: {:?}", item)))
        })
        .collect()
}

fn expect_dtype(value: &PickleValue) -> Result<DtypeDescr> {
    match value {
        PickleValue::Dtype(descr) => Ok(descr.clone()),
        other => match other.as_text() {
            Some(descr) => Ok(DtypeDescr::parse(&descr)),
            None => Err(PickleError::MalformedArray(format!(
                "dtype が必要ですが {} でした",
                other.type_name()
            ))),
        },
    }
}

fn reduce(callable: PickleValue, args: PickleValue) -> Result<PickleValue> {
    let global = match callable {
        PickleValue::Global(global) => global,
        other => {
            return Err(PickleError::InvalidValue(format!(
                "{} は呼び出しできません",
                other.type_name()
            )))
        }
    };
    let args = tuple_items(args, &format!("{}.{}", global.module, global.name))?;

    if global.is_reconstruct() {
        return Ok(PickleValue::PendingArray);
    }

    if global.is_dtype() {
        let descr = args
            .first()
            .and_then(|v| v.as_text())
            .ok_or_else(|| PickleError::InvalidValue("numpy.dtype の引数が不正です".to_string()))?;
        return Ok(PickleValue::Dtype(DtypeDescr::parse(&descr)));
    }

    if global.is_frombuffer() {
        // _frombuffer(buffer, dtype, shape, order)
        let mut args = args.into_iter();
        let (Some(buffer), Some(dtype), Some(shape), order) =
            (args.next(), args.next(), args.next(), args.next())
        else {
            return Err(PickleError::MalformedArray("_frombuffer の引数が不足しています".to_string()));
        };
        let data = match buffer {
            PickleValue::Bytes(bytes) => bytes,
            other => {
                return Err(PickleError::MalformedArray(format!(
                    "バッファが必要ですが {} でした",
                    other.type_name()
                )))
            }
        };
        let dtype = expect_dtype(&dtype)?;
        let shape = parse_shape(&shape)?;
        let fortran = order.and_then(|o| o.as_text().map(|s| s == "F")).unwrap_or(false);
        return Ok(PickleValue::Array(NdArray::new(shape, dtype, fortran, data)?));
    }

    if global.is(&["_codecs"], "encode") {
        // プロトコル 2 では bytes が _codecs.encode(str, "latin1") で表現される
        let text = args
            .first()
            .and_then(|v| v.as_text().map(|s| s.into_owned()))
            .ok_or_else(|| PickleError::InvalidValue("_codecs.encode の引数が不正です".to_string()))?;
        let bytes = text
            .chars()
            .map(|c| u8::try_from(c as u32))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| PickleError::InvalidValue("latin1 で表現できない文字".to_string()))?;
        return Ok(PickleValue::Bytes(bytes.into()));
    }

    if global.is(&["builtins", "__builtin__"], "bytearray") {
        return Ok(match args.into_iter().next() {
            Some(PickleValue::Bytes(bytes)) => PickleValue::Bytes(bytes),
            _ => PickleValue::Bytes(empty_bytes()),
        });
    }

    if global.is(&["collections"], "OrderedDict") {
        return Ok(PickleValue::Dict(Vec::new()));
    }

    Ok(PickleValue::Object { class: global, args })
}

fn new_object(class: PickleValue, args: PickleValue) -> Result<PickleValue> {
    match class {
        PickleValue::Global(global) => Ok(PickleValue::Object {
            class: global,
            args: tuple_items(args, "NEWOBJ")?,
        }),
        other => Err(PickleError::InvalidValue(format!(
            "{} はクラスではありません",
            other.type_name()
        ))),
    }
}

fn build(target: PickleValue, state: PickleValue) -> Result<PickleValue> {
    match target {
        PickleValue::PendingArray => {
            // (version, shape, dtype, is_fortran, data) または version なしの 4 要素
            let mut items = tuple_items(state, "ndarray.__setstate__")?;
            if items.len() == 5 {
                items.remove(0);
            }
            if items.len() != 4 {
                return Err(PickleError::MalformedArray(format!(
                    "状態タプルの要素数が不正です: {}",
                    items.len()
                )));
            }
            let shape = parse_shape(&items[0])?;
            let descr = expect_dtype(&items[1])?;
            let fortran = items[2].as_int().map(|v| v != 0).unwrap_or(false);
            let data = match (&descr, items.swap_remove(3)) {
                // 未対応の dtype（object 配列など）は中身を保持しない
                (DtypeDescr::Unsupported(_), _) => empty_bytes(),
                (_, PickleValue::Bytes(bytes)) => bytes,
                (_, PickleValue::String(s)) => Arc::from(s.into_bytes()),
                (_, other) => {
                    return Err(PickleError::MalformedArray(format!(
                        "配列データがバイト列ではありません ({})",
                        other.type_name()
                    )))
                }
            };
            Ok(PickleValue::Array(NdArray::new(shape, descr, fortran, data)?))
        }
        PickleValue::Dtype(DtypeDescr::Known(mut dtype)) => {
            // (version, byteorder, subdescr, names, fields, elsize, alignment, flags)
            if let PickleValue::Tuple(items) = &state {
                if let Some(order) = items.get(1).and_then(|v| v.as_text()) {
                    match order.as_ref() {
                        ">" => dtype.big_endian = true,
                        "<" | "|" | "=" => dtype.big_endian = false,
                        _ => {}
                    }
                }
            }
            Ok(PickleValue::Dtype(DtypeDescr::Known(dtype)))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! テスト用の pickle バイト列生成ヘルパー

    use std::collections::HashMap;

    /// numpy と同じく、バイトオーダーは dtype の引数ではなく状態タプルに書く
    fn split_descr(descr: &str) -> (&str, &str) {
        match descr.as_bytes().first() {
            Some(b'>') => (">", &descr[1..]),
            Some(b'<') | Some(b'|') => (&descr[..1], &descr[1..]),
            _ if descr.ends_with('1') || descr == "O" => ("|", descr),
            _ => ("<", descr),
        }
    }

    /// `_reconstruct` 形式（プロトコル 2）の配列。shape とデータはオペコード列で渡す
    pub fn reconstruct_raw(out: &mut Vec<u8>, shape_ops: &[u8], descr: &str, data_ops: &[u8]) {
        let (order, descr) = split_descr(descr);

        out.extend_from_slice(b"cnumpy.core.multiarray\n_reconstruct\n");
        out.extend_from_slice(b"cnumpy\nndarray\n");
        out.extend_from_slice(&[b'K', 0, 0x85]);
        out.extend_from_slice(&[b'C', 1, b'b']);
        out.push(0x87);
        out.push(b'R');

        // 状態タプル
        out.push(b'(');
        out.extend_from_slice(&[b'K', 1]);
        out.extend_from_slice(shape_ops);
        out.extend_from_slice(b"cnumpy\ndtype\n");
        short_unicode(out, descr);
        out.extend_from_slice(&[0x89, 0x88, 0x87, b'R']);
        out.push(b'(');
        out.extend_from_slice(&[b'K', 3]);
        short_unicode(out, order);
        out.extend_from_slice(&[b'N', b'N', b'N']);
        out.extend_from_slice(&[b'J']);
        out.extend_from_slice(&(-1i32).to_le_bytes());
        out.extend_from_slice(&[b'J']);
        out.extend_from_slice(&(-1i32).to_le_bytes());
        out.extend_from_slice(&[b'K', 0]);
        out.push(b't');
        out.push(b'b');
        out.push(0x89);
        out.extend_from_slice(data_ops);
        out.push(b't');
        out.push(b'b');
    }

    /// numpy の `_reconstruct` 形式（プロトコル 2）で配列を書き出す
    pub fn reconstruct_array(out: &mut Vec<u8>, shape: &[usize], descr: &str, data: &[u8]) {
        let mut shape_ops = vec![b'('];
        for &dim in shape {
            shape_ops.push(b'J');
            shape_ops.extend_from_slice(&(dim as i32).to_le_bytes());
        }
        shape_ops.push(b't');

        let mut data_ops = vec![b'B'];
        data_ops.extend_from_slice(&(data.len() as u32).to_le_bytes());
        data_ops.extend_from_slice(data);

        reconstruct_raw(out, &shape_ops, descr, &data_ops);
    }

    pub fn short_unicode(out: &mut Vec<u8>, s: &str) {
        out.push(0x8c);
        out.push(s.len() as u8);
        out.extend_from_slice(s.as_bytes());
    }

    /// `{"features": u8[N,H,W,C], "labels": u8[N]}` の pickle を生成する
    pub fn split_pickle(shape: [usize; 4], features: &[u8], labels: &[u8]) -> Vec<u8> {
        let mut out = vec![0x80, 4];
        out.push(b'}');
        out.push(0x94);
        out.push(b'(');
        short_unicode(&mut out, "features");
        reconstruct_array(&mut out, &shape, "u1", features);
        short_unicode(&mut out, "labels");
        reconstruct_array(&mut out, &[labels.len()], "u1", labels);
        out.push(b'u');
        out.push(b'.');
        out
    }

    /// `pickle.dumps(..., protocol=4)` と同じ形の辞書を書き出す
    ///
    /// 文字列・グローバル・タプルの直後に MEMOIZE を挟み、同じ文字列は BINGET で再利用する。
    /// 本体は 1 つの FRAME に収める。
    pub struct Protocol4Writer {
        body: Vec<u8>,
        memo: u32,
        strings: HashMap<String, u32>,
    }

    impl Protocol4Writer {
        pub fn new() -> Self {
            let mut writer = Self { body: Vec::new(), memo: 0, strings: HashMap::new() };
            writer.body.push(b'}');
            writer.memoize();
            writer.body.push(b'(');
            writer
        }

        fn memoize(&mut self) {
            self.body.push(0x94);
            self.memo += 1;
        }

        fn text(&mut self, s: &str) {
            if let Some(&index) = self.strings.get(s) {
                self.body.extend_from_slice(&[b'h', index as u8]);
                return;
            }
            short_unicode(&mut self.body, s);
            self.strings.insert(s.to_string(), self.memo);
            self.memoize();
        }

        fn global(&mut self, module: &str, name: &str) {
            self.text(module);
            self.text(name);
            self.body.push(0x93);
            self.memoize();
        }

        fn small_bytes(&mut self, data: &[u8]) {
            self.body.extend_from_slice(&[b'C', data.len() as u8]);
            self.body.extend_from_slice(data);
            self.memoize();
        }

        /// `key: ndarray` を 1 組追加する（descr はバイトオーダー付き、例 `<i8`）
        pub fn array(&mut self, key: &str, shape: &[usize], descr: &str, data: &[u8]) -> &mut Self {
            let (order, descr) = split_descr(descr);
            self.text(key);

            self.global("numpy.core.multiarray", "_reconstruct");
            self.global("numpy", "ndarray");
            self.body.extend_from_slice(&[b'K', 0, 0x85]);
            self.memoize();
            self.small_bytes(b"b");
            self.body.push(0x87);
            self.memoize();
            self.body.push(b'R');
            self.memoize();

            self.body.extend_from_slice(&[b'(', b'K', 1]);
            if shape.len() == 1 {
                self.body.extend_from_slice(&[b'K', shape[0] as u8, 0x85]);
            } else {
                self.body.push(b'(');
                for &dim in shape {
                    self.body.extend_from_slice(&[b'K', dim as u8]);
                }
                self.body.push(b't');
            }
            self.memoize();

            self.global("numpy", "dtype");
            self.text(descr);
            self.body.extend_from_slice(&[0x89, 0x88, 0x87]);
            self.memoize();
            self.body.push(b'R');
            self.memoize();
            self.body.extend_from_slice(&[b'(', b'K', 3]);
            self.text(order);
            self.body.extend_from_slice(b"NNN");
            self.body.push(b'J');
            self.body.extend_from_slice(&(-1i32).to_le_bytes());
            self.body.push(b'J');
            self.body.extend_from_slice(&(-1i32).to_le_bytes());
            self.body.extend_from_slice(&[b'K', 0, b't']);
            self.memoize();
            self.body.push(b'b');

            self.body.push(0x89);
            self.small_bytes(data);
            self.body.push(b't');
            self.memoize();
            self.body.push(b'b');
            self
        }

        pub fn finish(&mut self) -> Vec<u8> {
            let mut body = std::mem::take(&mut self.body);
            body.extend_from_slice(b"u.");

            let mut out = vec![0x80, 4, 0x95];
            out.extend_from_slice(&(body.len() as u64).to_le_bytes());
            out.extend_from_slice(&body);
            out
        }
    }
}
