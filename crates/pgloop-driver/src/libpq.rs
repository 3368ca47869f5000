//! libpq-backed driver.
//!
//! [`LibpqDriver`] opens real server connections through the system libpq
//! (via `pq-sys`) and drives them with libpq's asynchronous command
//! interface: `PQsendQueryParams`, `PQflush`, `PQconsumeInput`, `PQisBusy`
//! and `PQgetResult`. Results are copied out of libpq into owned
//! [`QueryResult`]s and the `PGresult` is cleared straight away.
//!
//! Enabled with the `libpq` feature. Linking needs libpq installed, or
//! `PQ_LIB_DIR` pointing at it.
//!
//! ```rust,ignore
//! use pgloop_driver::{ConnInfo, Driver, LibpqDriver};
//!
//! let conn = LibpqDriver.connect(&ConnInfo::from_env()?.to_conninfo())?;
//! assert!(conn.is_ok());
//! ```

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_char, c_int};
use std::ptr::{self, NonNull};

use pq_sys::{ConnStatusType, ExecStatusType, PGconn, PGresult};

use crate::connection::{ConnStatus, Connection, Driver, FlushStatus, RawSocket};
use crate::error::DriverError;
use crate::result::{ExecStatus, QueryResult, ResultError};

/// `PG_DIAG_SQLSTATE` field code for `PQresultErrorField`.
const PG_DIAG_SQLSTATE: c_int = b'C' as c_int;

/// Size of the buffer `PQcancel` writes its error into.
const CANCEL_ERRBUF_LEN: usize = 256;

/// Driver that connects through libpq.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibpqDriver;

impl Driver for LibpqDriver {
    fn connect(&self, conninfo: &str) -> Result<Box<dyn Connection>, DriverError> {
        let conninfo = CString::new(conninfo)
            .map_err(|_| DriverError::Config("conninfo contains a NUL byte".into()))?;

        // SAFETY: `conninfo` is a valid NUL-terminated string for the call.
        let raw = unsafe { pq_sys::PQconnectdb(conninfo.as_ptr()) };
        let conn = NonNull::new(raw)
            .map(|raw| LibpqConnection { raw })
            .ok_or_else(|| DriverError::Connect("libpq could not allocate a connection".into()))?;

        if conn.status() == ConnStatus::Bad {
            // Dropping `conn` finishes the failed handle.
            return Err(DriverError::Connect(conn.error_message()));
        }
        tracing::debug!(socket = ?conn.socket(), "libpq connection established");
        Ok(Box::new(conn))
    }
}

/// A connection owned by [`LibpqDriver`].
#[derive(Debug)]
pub struct LibpqConnection {
    raw: NonNull<PGconn>,
}

// SAFETY: a PGconn is not tied to the thread that opened it. libpq only
// requires that one thread uses a connection at a time, which `&mut self`
// on every mutating call and the lack of `Sync` guarantee.
unsafe impl Send for LibpqConnection {}

impl LibpqConnection {
    fn as_ptr(&self) -> *mut PGconn {
        self.raw.as_ptr()
    }
}

impl Connection for LibpqConnection {
    fn status(&self) -> ConnStatus {
        // SAFETY: `raw` is a live connection until drop.
        match unsafe { pq_sys::PQstatus(self.as_ptr()) } {
            ConnStatusType::CONNECTION_OK => ConnStatus::Ok,
            _ => ConnStatus::Bad,
        }
    }

    fn error_message(&self) -> String {
        // SAFETY: libpq returns a string owned by the connection, valid
        // until the next call on it; it is copied before returning.
        let message = unsafe { text(pq_sys::PQerrorMessage(self.as_ptr())) };
        message.unwrap_or_default().trim_end().to_string()
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DriverError> {
        // SAFETY: `raw` is a live connection.
        let rc = unsafe { pq_sys::PQsetnonblocking(self.as_ptr(), c_int::from(nonblocking)) };
        if rc == 0 {
            Ok(())
        } else {
            Err(DriverError::BlockingMode(self.error_message()))
        }
    }

    fn send_query(&mut self, sql: &str, params: &[Option<&str>]) -> Result<(), DriverError> {
        let sql = CString::new(sql)
            .map_err(|_| DriverError::Send("statement contains a NUL byte".into()))?;
        let params = c_params(params)?;
        let values: Vec<*const c_char> = params
            .iter()
            .map(|p| p.as_ref().map_or(ptr::null(), |p| p.as_ptr()))
            .collect();
        let count = c_int::try_from(values.len())
            .map_err(|_| DriverError::Send(format!("too many parameters: {}", values.len())))?;

        // SAFETY: `sql` and every non-null entry of `values` stay alive for
        // the call. Null types, lengths and formats ask libpq to infer types
        // and treat every value as text.
        let sent = unsafe {
            pq_sys::PQsendQueryParams(
                self.as_ptr(),
                sql.as_ptr(),
                count,
                ptr::null(),
                values.as_ptr(),
                ptr::null(),
                ptr::null(),
                0,
            )
        };
        if sent == 1 {
            Ok(())
        } else {
            Err(DriverError::Send(self.error_message()))
        }
    }

    fn flush(&mut self) -> Result<FlushStatus, DriverError> {
        // SAFETY: `raw` is a live connection.
        match unsafe { pq_sys::PQflush(self.as_ptr()) } {
            0 => Ok(FlushStatus::Done),
            1 => Ok(FlushStatus::Pending),
            _ => Err(DriverError::Io(self.error_message())),
        }
    }

    fn consume_input(&mut self) -> Result<(), DriverError> {
        // SAFETY: `raw` is a live connection.
        if unsafe { pq_sys::PQconsumeInput(self.as_ptr()) } == 1 {
            Ok(())
        } else {
            Err(DriverError::Io(self.error_message()))
        }
    }

    fn is_busy(&self) -> bool {
        // SAFETY: `raw` is a live connection.
        unsafe { pq_sys::PQisBusy(self.as_ptr()) == 1 }
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        // SAFETY: `raw` is a live connection. A non-null result is owned by
        // us and cleared when `OwnedResult` drops.
        let raw = NonNull::new(unsafe { pq_sys::PQgetResult(self.as_ptr()) })?;
        Some(OwnedResult(raw).to_query_result())
    }

    fn cancel(&mut self) -> Result<(), DriverError> {
        // SAFETY: `raw` is a live connection; the cancel object is freed
        // below on every path.
        let cancel = unsafe { pq_sys::PQgetCancel(self.as_ptr()) };
        if cancel.is_null() {
            return Err(DriverError::Cancel("no cancel handle for connection".into()));
        }

        let mut errbuf = [0 as c_char; CANCEL_ERRBUF_LEN];
        // SAFETY: `cancel` is non-null and `errbuf` is writable for its
        // full length. PQcancel NUL-terminates what it writes.
        let sent = unsafe {
            let sent = pq_sys::PQcancel(cancel, errbuf.as_mut_ptr(), CANCEL_ERRBUF_LEN as c_int);
            pq_sys::PQfreeCancel(cancel);
            sent
        };
        if sent == 1 {
            Ok(())
        } else {
            // SAFETY: `errbuf` was zeroed and holds a NUL-terminated string.
            let message = unsafe { CStr::from_ptr(errbuf.as_ptr()) };
            Err(DriverError::Cancel(message.to_string_lossy().into_owned()))
        }
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        // SAFETY: `raw` is a live connection; PQreset keeps the handle.
        unsafe { pq_sys::PQreset(self.as_ptr()) };
        match self.status() {
            ConnStatus::Ok => Ok(()),
            ConnStatus::Bad => Err(DriverError::Connect(self.error_message())),
        }
    }

    fn socket(&self) -> Option<RawSocket> {
        // SAFETY: `raw` is a live connection.
        let fd = unsafe { pq_sys::PQsocket(self.as_ptr()) };
        if fd < 0 {
            return None;
        }
        #[cfg(unix)]
        {
            Some(fd)
        }
        #[cfg(not(unix))]
        {
            RawSocket::try_from(fd).ok()
        }
    }
}

impl Drop for LibpqConnection {
    fn drop(&mut self) {
        // SAFETY: `raw` came from PQconnectdb and is finished exactly once.
        unsafe { pq_sys::PQfinish(self.as_ptr()) };
    }
}

/// A `PGresult` cleared on drop.
struct OwnedResult(NonNull<PGresult>);

impl OwnedResult {
    fn as_ptr(&self) -> *mut PGresult {
        self.0.as_ptr()
    }

    /// Copy the result out of libpq.
    fn to_query_result(&self) -> QueryResult {
        let res = self.as_ptr();
        // SAFETY: `res` is a live result for the lifetime of `self`. Every
        // string libpq returns is owned by the result and copied here;
        // row and column indices stay within PQntuples and PQnfields.
        unsafe {
            let status = exec_status(pq_sys::PQresultStatus(res));
            let nfields = pq_sys::PQnfields(res).max(0);
            let ntuples = pq_sys::PQntuples(res).max(0);

            let columns = (0..nfields)
                .map(|col| text(pq_sys::PQfname(res, col)).unwrap_or_default())
                .collect();
            let rows = (0..ntuples)
                .map(|row| {
                    (0..nfields)
                        .map(|col| {
                            if pq_sys::PQgetisnull(res, row, col) == 1 {
                                None
                            } else {
                                Some(text(pq_sys::PQgetvalue(res, row, col)).unwrap_or_default())
                            }
                        })
                        .collect()
                })
                .collect();
            let command_tag = text(pq_sys::PQcmdStatus(res)).unwrap_or_default();

            let error = if status.is_success() {
                None
            } else {
                let message = text(pq_sys::PQresultErrorMessage(res)).unwrap_or_default();
                let sqlstate = text(pq_sys::PQresultErrorField(res, PG_DIAG_SQLSTATE));
                (!message.is_empty() || sqlstate.is_some()).then(|| ResultError {
                    sqlstate,
                    message: message.trim_end().to_string(),
                })
            };

            QueryResult::from_parts(status, columns, rows, command_tag, error)
        }
    }
}

impl Drop for OwnedResult {
    fn drop(&mut self) {
        // SAFETY: the result came from PQgetResult and is cleared once.
        unsafe { pq_sys::PQclear(self.as_ptr()) };
    }
}

/// Map libpq's result status onto the driver-neutral one.
fn exec_status(status: ExecStatusType) -> ExecStatus {
    match status {
        ExecStatusType::PGRES_EMPTY_QUERY => ExecStatus::EmptyQuery,
        ExecStatusType::PGRES_COMMAND_OK => ExecStatus::CommandOk,
        ExecStatusType::PGRES_TUPLES_OK => ExecStatus::TuplesOk,
        ExecStatusType::PGRES_COPY_OUT => ExecStatus::CopyOut,
        ExecStatusType::PGRES_COPY_IN => ExecStatus::CopyIn,
        ExecStatusType::PGRES_NONFATAL_ERROR => ExecStatus::NonfatalError,
        ExecStatusType::PGRES_FATAL_ERROR => ExecStatus::FatalError,
        ExecStatusType::PGRES_SINGLE_TUPLE => ExecStatus::SingleTuple,
        // COPY BOTH and the pipeline-mode statuses are never requested.
        #[allow(unreachable_patterns)]
        _ => ExecStatus::BadResponse,
    }
}

/// Convert statement parameters to C strings, keeping NULLs.
fn c_params(params: &[Option<&str>]) -> Result<Vec<Option<CString>>, DriverError> {
    params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            param
                .map(CString::new)
                .transpose()
                .map_err(|_| DriverError::Send(format!("parameter ${} contains a NUL byte", i + 1)))
        })
        .collect()
}

/// Copy a libpq string. Null pointers read as `None`.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
unsafe fn text(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}
