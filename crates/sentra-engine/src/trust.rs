//! Trusted-publisher oracle.
//!
//! On Windows the oracle verifies a file's Authenticode signature and
//! accepts the file when the signer's display name contains one of the
//! allow-listed vendor substrings. On every other platform it is a constant
//! `false`. The check never raises: verification failures, missing
//! signatures and API errors all yield "not trusted".

use std::path::Path;

/// Vendors whose valid signatures allow skipping the detection cascade.
const DEFAULT_ALLOW_LIST: &[&str] = &["microsoft", "google", "apple", "intel", "amazon"];

#[derive(Debug, Clone)]
pub struct TrustOracle {
    allow_list: Vec<String>,
}

impl Default for TrustOracle {
    fn default() -> Self {
        Self {
            allow_list: DEFAULT_ALLOW_LIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TrustOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the vendor allow-list. Entries are compared lowercase.
    pub fn with_allow_list(allow_list: Vec<String>) -> Self {
        Self {
            allow_list: allow_list.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// `true` iff the file carries a valid signature from an allow-listed
    /// publisher. Best-effort; never errors.
    pub fn is_trusted(&self, path: &Path) -> bool {
        #[cfg(windows)]
        {
            match windows::signer_display_name(path) {
                Some(signer) => {
                    let lowered = signer.to_lowercase();
                    self.allow_list
                        .iter()
                        .any(|s| !s.is_empty() && lowered.contains(s))
                }
                None => false,
            }
        }
        #[cfg(not(windows))]
        {
            let _ = path;
            false
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::ffi::c_void;
    use std::mem;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr;

    use windows_sys::Win32::Foundation::ERROR_SUCCESS;
    use windows_sys::Win32::Security::Cryptography::{
        CertGetNameStringW, CERT_NAME_SIMPLE_DISPLAY_TYPE,
    };
    use windows_sys::Win32::Security::WinTrust::{
        WTHelperGetProvCertFromChain, WTHelperGetProvSignerFromChain,
        WTHelperProvDataFromStateData, WinVerifyTrust, WINTRUST_ACTION_GENERIC_VERIFY_V2,
        WINTRUST_DATA, WINTRUST_DATA_0, WINTRUST_FILE_INFO, WTD_CHOICE_FILE,
        WTD_REVOCATION_CHECK_NONE, WTD_REVOKE_NONE, WTD_STATEACTION_CLOSE,
        WTD_STATEACTION_VERIFY, WTD_UI_NONE,
    };

    /// Validate the Authenticode signature of `path` and return the signer's
    /// display name, or `None` if the signature is absent or invalid.
    pub(super) fn signer_display_name(path: &Path) -> Option<String> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();

        let mut file_info: WINTRUST_FILE_INFO = unsafe { mem::zeroed() };
        file_info.cbStruct = mem::size_of::<WINTRUST_FILE_INFO>() as u32;
        file_info.pcwszFilePath = wide.as_ptr();

        let mut data: WINTRUST_DATA = unsafe { mem::zeroed() };
        data.cbStruct = mem::size_of::<WINTRUST_DATA>() as u32;
        data.dwUIChoice = WTD_UI_NONE;
        data.fdwRevocationChecks = WTD_REVOKE_NONE;
        data.dwUnionChoice = WTD_CHOICE_FILE;
        data.Anonymous = WINTRUST_DATA_0 {
            pFile: &mut file_info,
        };
        data.dwStateAction = WTD_STATEACTION_VERIFY;
        data.dwProvFlags = WTD_REVOCATION_CHECK_NONE;

        let mut action = WINTRUST_ACTION_GENERIC_VERIFY_V2;
        let status =
            unsafe { WinVerifyTrust(ptr::null_mut(), &mut action, &mut data as *mut _ as *mut c_void) };

        let name = if status == ERROR_SUCCESS as i32 {
            unsafe { extract_signer_name(data.hWVTStateData as *mut c_void) }
        } else {
            None
        };

        // Always release the verification state.
        data.dwStateAction = WTD_STATEACTION_CLOSE;
        unsafe {
            WinVerifyTrust(ptr::null_mut(), &mut action, &mut data as *mut _ as *mut c_void);
        }

        name
    }

    unsafe fn extract_signer_name(state: *mut c_void) -> Option<String> {
        let prov_data = WTHelperProvDataFromStateData(state as isize);
        if prov_data.is_null() {
            return None;
        }
        let signer = WTHelperGetProvSignerFromChain(prov_data, 0, 0, 0);
        if signer.is_null() {
            return None;
        }
        let cert = WTHelperGetProvCertFromChain(signer, 0);
        if cert.is_null() || (*cert).pCert.is_null() {
            return None;
        }

        let mut buf = [0u16; 512];
        let len = CertGetNameStringW(
            (*cert).pCert,
            CERT_NAME_SIMPLE_DISPLAY_TYPE,
            0,
            ptr::null(),
            buf.as_mut_ptr(),
            buf.len() as u32,
        );
        if len <= 1 {
            return None;
        }
        Some(String::from_utf16_lossy(&buf[..(len as usize - 1)]))
    }
}
