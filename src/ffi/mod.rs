//! C-callable boundary for host VPN apps
//!
//! Mirrors `libengine.h`. Tunnels are opaque heap pointers owned by the
//! caller until `tunnel_free`. Every entry point tolerates null pointers and
//! malformed strings.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::slice;

use crate::config::TunnelConfig;
use crate::crypto::keys;
use crate::crypto::x25519::SecretKey;
use crate::logging;
use crate::tunnel::{Action, Tunn};

/// Callback receiving one NUL-terminated log line
pub type LogPrinter = extern "C" fn(*const c_char);

/// What the caller must do with `dst` after a call
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Done = 0,
    WriteToNetwork = 1,
    Error = 2,
    WriteToTunnelIpv4 = 4,
    WriteToTunnelIpv6 = 6,
}

/// The return type of tunnel functions.
///
/// `size` is the byte count in `dst`, or the error code when `op` is
/// [`ResultType::Error`]. Code 0 means an invalid argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireguardResult {
    pub op: ResultType,
    pub size: usize,
}

impl WireguardResult {
    const INVALID_ARGUMENT: Self = Self {
        op: ResultType::Error,
        size: 0,
    };
}

impl From<Action> for WireguardResult {
    fn from(action: Action) -> Self {
        let (op, size) = match action {
            Action::Done => (ResultType::Done, 0),
            Action::WriteToNetwork(n) => (ResultType::WriteToNetwork, n),
            Action::WriteToTunnelV4(n) => (ResultType::WriteToTunnelIpv4, n),
            Action::WriteToTunnelV6(n) => (ResultType::WriteToTunnelIpv6, n),
            Action::Err(e) => (ResultType::Error, e.code()),
        };
        Self { op, size }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X25519Key {
    pub key: [u8; 32],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X25519PublicKey {
    pub internal: [u8; 32],
}

#[repr(C)]
pub struct X25519SecretKey {
    pub internal: [u8; 32],
}

#[repr(C)]
pub struct Base64Keypair {
    pub public_key: *const c_char,
    pub private_key: *const c_char,
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

unsafe fn input<'a>(ptr: *const u8, len: u32) -> Option<&'a [u8]> {
    if len == 0 {
        return Some(&[]);
    }
    if ptr.is_null() {
        return None;
    }
    Some(slice::from_raw_parts(ptr, len as usize))
}

unsafe fn output<'a>(ptr: *mut u8, len: u32) -> Option<&'a mut [u8]> {
    if ptr.is_null() {
        return None;
    }
    Some(slice::from_raw_parts_mut(ptr, len as usize))
}

fn into_c_string(s: String) -> *const c_char {
    match CString::new(s) {
        Ok(s) => s.into_raw(),
        Err(_) => ptr::null(),
    }
}

fn printer_sink(printer: LogPrinter) -> impl Fn(&str) + Send + Sync + 'static {
    move |line: &str| {
        if let Ok(line) = CString::new(line.replace('\0', "")) {
            printer(line.as_ptr());
        }
    }
}

/// Map the numeric verbosity of `new_tunnel` to a filter directive
fn verbosity_filter(level: u32) -> Option<&'static str> {
    match level {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Allocate a new tunnel, return NULL on failure.
/// Keys must be valid base64 encoded 32-byte keys.
#[no_mangle]
pub unsafe extern "C" fn new_tunnel(
    static_private: *const c_char,
    server_static_public: *const c_char,
    log_printer: Option<LogPrinter>,
    log_level: u32,
) -> *mut Tunn {
    if let Some(printer) = log_printer {
        logging::set_sink(printer_sink(printer));
        if let Some(filter) = verbosity_filter(log_level) {
            logging::init(filter);
        }
    }

    let (Some(secret), Some(public)) = (c_str(static_private), c_str(server_static_public))
    else {
        return ptr::null_mut();
    };

    match Tunn::from_base64(secret, public, TunnelConfig::default()) {
        Ok(tunnel) => Box::into_raw(Box::new(tunnel)),
        Err(e) => {
            tracing::error!("Failed to create tunnel: {}", e);
            ptr::null_mut()
        }
    }
}

/// Drops the tunnel, wiping its keys
#[no_mangle]
pub unsafe extern "C" fn tunnel_free(tunnel: *mut Tunn) {
    if tunnel.is_null() {
        return;
    }
    Box::from_raw(tunnel).destroy();
}

/// Write an IP packet from the tunnel interface.
#[no_mangle]
pub unsafe extern "C" fn wireguard_write(
    tunnel: *mut Tunn,
    src: *const u8,
    src_size: u32,
    dst: *mut u8,
    dst_size: u32,
) -> WireguardResult {
    let (Some(tunnel), Some(src), Some(dst)) =
        (tunnel.as_mut(), input(src, src_size), output(dst, dst_size))
    else {
        return WireguardResult::INVALID_ARGUMENT;
    };
    tunnel.on_outbound_packet(src, dst).into()
}

/// Read a UDP datagram from the peer. An empty `src` flushes queued packets;
/// repeat while the result is `WriteToNetwork`.
#[no_mangle]
pub unsafe extern "C" fn wireguard_read(
    tunnel: *mut Tunn,
    src: *const u8,
    src_size: u32,
    dst: *mut u8,
    dst_size: u32,
) -> WireguardResult {
    let (Some(tunnel), Some(src), Some(dst)) =
        (tunnel.as_mut(), input(src, src_size), output(dst, dst_size))
    else {
        return WireguardResult::INVALID_ARGUMENT;
    };
    tunnel.on_inbound_datagram(src, dst).into()
}

/// State keeping function, to be called every 100 ms or so.
#[no_mangle]
pub unsafe extern "C" fn wireguard_tick(
    tunnel: *mut Tunn,
    dst: *mut u8,
    dst_size: u32,
) -> WireguardResult {
    let (Some(tunnel), Some(dst)) = (tunnel.as_mut(), output(dst, dst_size)) else {
        return WireguardResult::INVALID_ARGUMENT;
    };
    tunnel.on_tick(dst).into()
}

/// Force a new handshake. `dst` must hold at least 148 bytes.
#[no_mangle]
pub unsafe extern "C" fn wireguard_force_handshake(
    tunnel: *mut Tunn,
    dst: *mut u8,
    dst_size: u32,
) -> WireguardResult {
    let (Some(tunnel), Some(dst)) = (tunnel.as_mut(), output(dst, dst_size)) else {
        return WireguardResult::INVALID_ARGUMENT;
    };
    tunnel.force_handshake(dst).into()
}

/// Generates a new x25519 secret key.
#[no_mangle]
pub extern "C" fn x25519_secret_key() -> X25519SecretKey {
    X25519SecretKey {
        internal: SecretKey::generate().to_bytes(),
    }
}

/// Computes a public x25519 key from a secret key.
#[no_mangle]
pub extern "C" fn x25519_public_key(private_key: X25519SecretKey) -> X25519PublicKey {
    let secret = SecretKey::from_bytes(private_key.internal);
    X25519PublicKey {
        internal: secret.public_key().to_bytes(),
    }
}

/// Base64 of a key as a C string, freed with `x25519_key_to_str_free`
#[no_mangle]
pub extern "C" fn x25519_key_to_base64(key: X25519Key) -> *const c_char {
    into_c_string(keys::to_base64(&key.key))
}

/// Hex of a key as a C string, freed with `x25519_key_to_str_free`
#[no_mangle]
pub extern "C" fn x25519_key_to_hex(key: X25519Key) -> *const c_char {
    into_c_string(keys::to_hex(&key.key))
}

#[no_mangle]
pub unsafe extern "C" fn x25519_key_to_str_free(stringified_key: *mut c_char) {
    if !stringified_key.is_null() {
        drop(CString::from_raw(stringified_key));
    }
}

/// Return 1 if `key` is a valid base64 encoded x25519 key, 0 otherwise.
#[no_mangle]
pub unsafe extern "C" fn check_base64_encoded_x25519_key(key: *const c_char) -> i32 {
    match c_str(key) {
        Some(key) if keys::validate_key_string(key) => 1,
        _ => 0,
    }
}

/// Generates a new keypair as base64 strings. Free with `keypair_free`.
#[no_mangle]
pub extern "C" fn keypair_new() -> *mut Base64Keypair {
    let secret = SecretKey::generate();
    let public = secret.public_key();

    let private_key = into_c_string(secret.to_base64());
    let public_key = into_c_string(public.to_base64());
    Box::into_raw(Box::new(Base64Keypair {
        public_key,
        private_key,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn keypair_free(keypair: *mut Base64Keypair) {
    if keypair.is_null() {
        return;
    }
    let keypair = Box::from_raw(keypair);
    for s in [keypair.public_key, keypair.private_key] {
        if !s.is_null() {
            let mut s = CString::from_raw(s as *mut c_char).into_bytes();
            zeroize::Zeroize::zeroize(&mut s);
        }
    }
}

/// Route panic messages to `log_printer`
#[no_mangle]
pub extern "C" fn panic_hook(log_printer: Option<LogPrinter>) {
    if let Some(printer) = log_printer {
        logging::set_sink(printer_sink(printer));
    }
    logging::install_panic_hook();
}

/// Install the global log subscriber at `level` ("info", "debug", ...)
#[no_mangle]
pub unsafe extern "C" fn engine_logger(level: *const c_char) {
    match c_str(level) {
        Some(level) => {
            if !logging::init(level) {
                tracing::debug!("Logger already installed or bad level {:?}", level);
            }
        }
        None => tracing::warn!("engine_logger called without a valid level"),
    }
}
