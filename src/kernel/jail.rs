//! Jail parameters and the create-and-attach call.
//!
//! Settings arrive as strings. Before fork each one is resolved against the
//! kernel's `security.jail.param.*` sysctl tree to learn its type, then
//! encoded into the binary form `jail_set(2)` expects. The child only hands
//! the prepared buffers to the kernel.

use crate::config::types::{JailError, ParameterSet, Result};
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::net::{Ipv4Addr, Ipv6Addr};

const JAIL_CREATE: libc::c_int = 0x01;
const JAIL_ATTACH: libc::c_int = 0x04;

/// Value type of a jail parameter, as advertised by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// NUL-terminated string; `max_len` includes the terminator (0 = unknown).
    String { max_len: usize },
    Int,
    UInt,
    Long,
    ULong,
    Quad,
    UQuad,
    Bool,
    /// `disable` / `new` / `inherit`
    JailSys,
    Ipv4,
    Ipv6,
}

impl ParamKind {
    /// Map a sysctl format string (`A`, `I`, `IU`, `S,in_addr`, ...) to a kind.
    pub fn from_format(fmt: &str, max_len: usize) -> Option<Self> {
        let kind = match fmt {
            "A" => ParamKind::String { max_len },
            "I" => ParamKind::Int,
            "IU" => ParamKind::UInt,
            "L" => ParamKind::Long,
            "LU" => ParamKind::ULong,
            "Q" => ParamKind::Quad,
            "QU" => ParamKind::UQuad,
            "B" => ParamKind::Bool,
            "S,in_addr" => ParamKind::Ipv4,
            "S,in6_addr" => ParamKind::Ipv6,
            f if f.starts_with('E') => ParamKind::JailSys,
            _ => return None,
        };
        Some(kind)
    }

    /// Encode `value` for `jail_set(2)`. `negated` is set for `no`-prefixed
    /// booleans. String parameters take the raw bytes; every other kind must
    /// be valid UTF-8 text.
    pub fn encode(
        self,
        value: impl AsRef<OsStr>,
        negated: bool,
    ) -> std::result::Result<Vec<u8>, String> {
        fn num<T: std::str::FromStr>(value: &str) -> std::result::Result<T, String> {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| format!("invalid numeric value: {:?}", value))
        }

        let raw = value.as_ref();
        let text = move || {
            raw.to_str()
                .ok_or_else(|| format!("value is not valid UTF-8: {:?}", raw))
        };

        let bytes = match self {
            ParamKind::String { max_len } => {
                let c = CString::new(raw.as_bytes())
                    .map_err(|_| "value contains NUL byte".to_string())?;
                let bytes = c.into_bytes_with_nul();
                if max_len > 0 && bytes.len() > max_len {
                    return Err(format!("value too long (limit {})", max_len - 1));
                }
                bytes
            }
            ParamKind::Int => num::<i32>(text()?)?.to_ne_bytes().to_vec(),
            ParamKind::UInt => num::<u32>(text()?)?.to_ne_bytes().to_vec(),
            ParamKind::Long => num::<libc::c_long>(text()?)?.to_ne_bytes().to_vec(),
            ParamKind::ULong => num::<libc::c_ulong>(text()?)?.to_ne_bytes().to_vec(),
            ParamKind::Quad => num::<i64>(text()?)?.to_ne_bytes().to_vec(),
            ParamKind::UQuad => num::<u64>(text()?)?.to_ne_bytes().to_vec(),
            ParamKind::Bool => {
                let value = text()?;
                let truth = match value.to_ascii_lowercase().as_str() {
                    "" | "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" => false,
                    _ => return Err(format!("invalid boolean value: {:?}", value)),
                };
                i32::from(truth != negated).to_ne_bytes().to_vec()
            }
            ParamKind::JailSys => {
                let v: i32 = match text()? {
                    "disable" => 0,
                    "new" => 1,
                    "inherit" => 2,
                    other => num::<i32>(other)?,
                };
                v.to_ne_bytes().to_vec()
            }
            ParamKind::Ipv4 => split_list(text()?)
                .map(|a| {
                    a.parse::<Ipv4Addr>()
                        .map(|ip| ip.octets().to_vec())
                        .map_err(|_| format!("invalid IPv4 address: {:?}", a))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?
                .concat(),
            ParamKind::Ipv6 => split_list(text()?)
                .map(|a| {
                    a.parse::<Ipv6Addr>()
                        .map(|ip| ip.octets().to_vec())
                        .map_err(|_| format!("invalid IPv6 address: {:?}", a))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?
                .concat(),
        };
        Ok(bytes)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|a| !a.is_empty())
}

/// Split a `no`-prefixed boolean name: `nopersist` -> `persist`,
/// `allow.nomount` -> `allow.mount`.
pub fn strip_negation(name: &str) -> Option<String> {
    let (prefix, last) = match name.rfind('.') {
        Some(dot) => (&name[..=dot], &name[dot + 1..]),
        None => ("", name),
    };
    last.strip_prefix("no")
        .filter(|rest| !rest.is_empty())
        .map(|rest| format!("{}{}", prefix, rest))
}

/// One parameter in kernel form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailParam {
    pub name: CString,
    pub kind: ParamKind,
    pub value: Vec<u8>,
}

/// Parameters ready for `jail_set(2)`, in command-line order.
#[derive(Debug, Clone, Default)]
pub struct JailParams {
    params: Vec<JailParam>,
}

impl JailParams {
    pub fn iter(&self) -> impl Iterator<Item = &JailParam> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Resolve and encode every setting. Runs in the supervisor before fork so a
/// bad setting never produces a child.
pub fn import(settings: &ParameterSet) -> Result<JailParams> {
    if settings.is_empty() {
        log::debug!("no jail parameters given");
        return Ok(JailParams::default());
    }
    let mut params = Vec::with_capacity(settings.len());
    for setting in settings.iter() {
        let (kernel_name, kind, negated) = resolve(&setting.name)?;
        let value = kind.encode(&setting.value, negated).map_err(|detail| {
            JailError::Parameter(format!("jail error: {}: {}", setting.name, detail))
        })?;
        let name = CString::new(kernel_name).map_err(|_| {
            JailError::Parameter(format!("invalid jail parameter: {:?}", setting.name))
        })?;
        log::debug!("jail parameter {} -> {:?} ({} bytes)", setting.name, kind, value.len());
        params.push(JailParam { name, kind, value });
    }
    Ok(JailParams { params })
}

/// Find the kernel name and type for `name`, honouring `no` negation.
fn resolve(name: &str) -> Result<(String, ParamKind, bool)> {
    if let Some(kind) = sys::lookup(name)? {
        return Ok((name.to_string(), kind, false));
    }
    if let Some(positive) = strip_negation(name) {
        if let Some(ParamKind::Bool) = sys::lookup(&positive)? {
            return Ok((positive, ParamKind::Bool, true));
        }
    }
    Err(JailError::Parameter(format!("invalid jail parameter: {}", name)))
}

/// Create a new jail from `params` and move the calling process into it.
/// Returns the new jail id.
pub fn create_and_attach(params: &JailParams) -> Result<i32> {
    let jid = sys::jail_set(params, JAIL_CREATE | JAIL_ATTACH)?;
    log::info!("created and attached to jail {}", jid);
    Ok(jid)
}

#[cfg(target_os = "freebsd")]
mod sys {
    use super::*;
    use nix::errno::Errno;
    use std::ffi::CStr;

    const JAIL_ERRMSGLEN: usize = 1024;
    const CTL_MAXNAME: usize = 24;
    const CTLTYPE_MASK: u32 = 0xf;
    const CTLTYPE_NODE: u32 = 1;
    const CTLTYPE_STRING: u32 = 3;

    /// Look up `security.jail.param.<name>` (or the node form `<name>.`).
    pub(super) fn lookup(name: &str) -> Result<Option<ParamKind>> {
        let candidates = [
            format!("security.jail.param.{}", name),
            format!("security.jail.param.{}.", name),
        ];
        for candidate in candidates {
            let Some(oid) = name_to_oid(&candidate)? else {
                continue;
            };
            let (ctl_kind, fmt) = oid_format(&oid)
                .map_err(|e| JailError::Parameter(format!("sysctl({}): {}", candidate, e)))?;
            if ctl_kind & CTLTYPE_MASK == CTLTYPE_NODE && !fmt.starts_with('E') {
                continue;
            }
            let max_len = if ctl_kind & CTLTYPE_MASK == CTLTYPE_STRING {
                string_limit(&oid).unwrap_or(0)
            } else {
                0
            };
            return ParamKind::from_format(&fmt, max_len).map(Some).ok_or_else(|| {
                JailError::Parameter(format!(
                    "jail error: {}: unsupported parameter type {:?}",
                    name, fmt
                ))
            });
        }
        Ok(None)
    }

    fn name_to_oid(name: &str) -> Result<Option<Vec<libc::c_int>>> {
        let mib: [libc::c_int; 2] = [0, 3];
        let mut oid = [0 as libc::c_int; CTL_MAXNAME];
        let mut len = std::mem::size_of_val(&oid);
        // SAFETY: the output buffer and its length match; the new value is the
        // name without terminator, as the name2oid node expects.
        let rc = unsafe {
            libc::sysctl(
                mib.as_ptr(),
                mib.len() as libc::c_uint,
                oid.as_mut_ptr().cast(),
                &mut len,
                name.as_ptr().cast(),
                name.len(),
            )
        };
        match Errno::result(rc) {
            Ok(_) => Ok(Some(oid[..len / std::mem::size_of::<libc::c_int>()].to_vec())),
            Err(Errno::ENOENT) => Ok(None),
            Err(e) => Err(JailError::Parameter(format!("sysctl({}): {}", name, e))),
        }
    }

    fn oid_format(oid: &[libc::c_int]) -> nix::Result<(u32, String)> {
        let mut mib = vec![0, 4];
        mib.extend_from_slice(oid);
        let mut buf = [0u8; 1024];
        let mut len = buf.len();
        // SAFETY: buffer and length match; no new value is written.
        let rc = unsafe {
            libc::sysctl(
                mib.as_ptr(),
                mib.len() as libc::c_uint,
                buf.as_mut_ptr().cast(),
                &mut len,
                std::ptr::null(),
                0,
            )
        };
        Errno::result(rc)?;
        if len < 5 {
            return Err(Errno::EINVAL);
        }
        let kind = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let fmt = CStr::from_bytes_until_nul(&buf[4..len])
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok((kind, fmt))
    }

    /// String parameters report their maximum length, in decimal, as their
    /// value.
    fn string_limit(oid: &[libc::c_int]) -> Option<usize> {
        let mut buf = [0u8; 32];
        let mut len = buf.len();
        // SAFETY: buffer and length match; no new value is written.
        let rc = unsafe {
            libc::sysctl(
                oid.as_ptr(),
                oid.len() as libc::c_uint,
                buf.as_mut_ptr().cast(),
                &mut len,
                std::ptr::null(),
                0,
            )
        };
        Errno::result(rc).ok()?;
        CStr::from_bytes_until_nul(&buf[..len.min(buf.len())])
            .ok()?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub(super) fn jail_set(params: &JailParams, flags: libc::c_int) -> Result<i32> {
        let mut errmsg = [0u8; JAIL_ERRMSGLEN];
        let errmsg_name = c"errmsg";
        let mut iov: Vec<libc::iovec> = Vec::with_capacity(params.len() * 2 + 2);
        for param in params.iter() {
            let name = param.name.as_bytes_with_nul();
            iov.push(libc::iovec {
                iov_base: name.as_ptr() as *mut libc::c_void,
                iov_len: name.len(),
            });
            iov.push(libc::iovec {
                iov_base: if param.value.is_empty() {
                    std::ptr::null_mut()
                } else {
                    param.value.as_ptr() as *mut libc::c_void
                },
                iov_len: param.value.len(),
            });
        }
        iov.push(libc::iovec {
            iov_base: errmsg_name.as_ptr() as *mut libc::c_void,
            iov_len: errmsg_name.to_bytes_with_nul().len(),
        });
        iov.push(libc::iovec {
            iov_base: errmsg.as_mut_ptr().cast(),
            iov_len: errmsg.len(),
        });

        // SAFETY: every iovec points into a buffer that outlives the call; the
        // kernel only writes into the errmsg buffer.
        let jid = unsafe { libc::jail_set(iov.as_mut_ptr(), iov.len() as libc::c_uint, flags) };
        if jid < 0 {
            let errno = Errno::last();
            let msg = CStr::from_bytes_until_nul(&errmsg)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let detail = if msg.is_empty() { errno.to_string() } else { msg };
            return Err(JailError::child("jail_set", detail));
        }
        Ok(jid)
    }
}

#[cfg(not(target_os = "freebsd"))]
mod sys {
    use super::*;

    pub(super) fn lookup(_name: &str) -> Result<Option<ParamKind>> {
        Err(JailError::Unsupported("jail parameters"))
    }

    pub(super) fn jail_set(_params: &JailParams, _flags: libc::c_int) -> Result<i32> {
        Err(JailError::child("jail_set", JailError::Unsupported("jail")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_map_to_kinds() {
        assert_eq!(ParamKind::from_format("A", 256), Some(ParamKind::String { max_len: 256 }));
        assert_eq!(ParamKind::from_format("I", 0), Some(ParamKind::Int));
        assert_eq!(ParamKind::from_format("IU", 0), Some(ParamKind::UInt));
        assert_eq!(ParamKind::from_format("B", 0), Some(ParamKind::Bool));
        assert_eq!(ParamKind::from_format("E,jailsys", 0), Some(ParamKind::JailSys));
        assert_eq!(ParamKind::from_format("S,in_addr", 0), Some(ParamKind::Ipv4));
        assert_eq!(ParamKind::from_format("S,in6_addr", 0), Some(ParamKind::Ipv6));
        assert_eq!(ParamKind::from_format("S,vnet", 0), None);
    }

    #[test]
    fn strings_are_nul_terminated_and_bounded() {
        let kind = ParamKind::String { max_len: 6 };
        assert_eq!(kind.encode("jail", false).unwrap(), b"jail\0");
        assert!(kind.encode("toolong", false).is_err());
        assert!(ParamKind::String { max_len: 0 }.encode("a\0b", false).is_err());
    }

    #[test]
    fn integers_use_native_layout() {
        assert_eq!(ParamKind::Int.encode("-3", false).unwrap(), (-3i32).to_ne_bytes());
        assert_eq!(ParamKind::UQuad.encode("7", false).unwrap(), 7u64.to_ne_bytes());
        assert!(ParamKind::UInt.encode("-1", false).is_err());
        assert!(ParamKind::Int.encode("ten", false).is_err());
    }

    #[test]
    fn booleans_accept_words_and_negation() {
        let one = 1i32.to_ne_bytes().to_vec();
        let zero = 0i32.to_ne_bytes().to_vec();
        assert_eq!(ParamKind::Bool.encode("", false).unwrap(), one);
        assert_eq!(ParamKind::Bool.encode("Yes", false).unwrap(), one);
        assert_eq!(ParamKind::Bool.encode("off", false).unwrap(), zero);
        assert_eq!(ParamKind::Bool.encode("", true).unwrap(), zero);
        assert_eq!(ParamKind::Bool.encode("false", true).unwrap(), one);
        assert!(ParamKind::Bool.encode("maybe", false).is_err());
    }

    #[test]
    fn jailsys_accepts_names() {
        assert_eq!(ParamKind::JailSys.encode("inherit", false).unwrap(), 2i32.to_ne_bytes());
        assert_eq!(ParamKind::JailSys.encode("new", false).unwrap(), 1i32.to_ne_bytes());
        assert!(ParamKind::JailSys.encode("sometimes", false).is_err());
    }

    #[test]
    fn address_lists_are_concatenated_in_network_order() {
        let v4 = ParamKind::Ipv4.encode("10.0.0.1, 192.168.1.2", false).unwrap();
        assert_eq!(v4, [10, 0, 0, 1, 192, 168, 1, 2]);
        assert!(ParamKind::Ipv4.encode("", false).unwrap().is_empty());
        assert!(ParamKind::Ipv4.encode("10.0.0.256", false).is_err());

        let v6 = ParamKind::Ipv6.encode("::1", false).unwrap();
        assert_eq!(v6.len(), 16);
        assert_eq!(v6[15], 1);
    }

    #[test]
    fn negation_strips_last_component_prefix() {
        assert_eq!(strip_negation("nopersist").as_deref(), Some("persist"));
        assert_eq!(strip_negation("allow.nomount").as_deref(), Some("allow.mount"));
        assert_eq!(strip_negation("no"), None);
        assert_eq!(strip_negation("name"), None);
        assert_eq!(strip_negation("allow.raw_sockets"), None);
    }

    #[test]
    fn string_values_keep_non_utf8_bytes() {
        let kind = ParamKind::String { max_len: 0 };
        let value = OsStr::from_bytes(b"/jails/\xff");
        assert_eq!(kind.encode(value, false).unwrap(), b"/jails/\xff\0");

        let err = ParamKind::Int.encode(OsStr::from_bytes(b"1\xff"), false).unwrap_err();
        assert!(err.starts_with("value is not valid UTF-8"), "{}", err);
    }

    #[test]
    fn empty_settings_import_to_empty_params() {
        let params = import(&ParameterSet::new()).unwrap();
        assert!(params.is_empty());
    }

    #[cfg(not(target_os = "freebsd"))]
    #[test]
    fn import_is_unsupported_without_jails() {
        use crate::config::types::JailSetting;

        let settings: ParameterSet = std::iter::once(JailSetting::new("path", "/")).collect();
        assert!(matches!(import(&settings), Err(JailError::Unsupported(_))));
        assert!(create_and_attach(&JailParams::default()).is_err());
    }
}
