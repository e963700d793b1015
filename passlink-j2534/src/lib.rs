//! Pass-Thru (04.04) C ABI.
//!
//! Thin translation from the published entry points to
//! [`passlink::DeviceManager`] calls. Every boundary catches unwinds and
//! converts them to `ERR_FAILED` with a last-error string; the core never
//! intentionally panics, but a panic must not cross into a C caller.
//!
//! Types follow the published structure layout, which fixes every
//! `unsigned long` at 32 bits; return values are the status codes of
//! [`passlink::ErrorCode`] with `0` for success.

use std::ffi::{c_char, c_void};
use std::panic::{catch_unwind, UnwindSafe};

use passlink::passthru::ioctl;
use passlink::{DeviceManager, ErrorCode, PassThruMsg, SConfig};

/// Successful return value.
pub const STATUS_NOERROR: i32 = 0;

/// Capacity of the caller-provided string buffers (version strings, last
/// error), including the terminating NUL.
const STRING_BUFFER_LEN: usize = 80;

/// `GET_CONFIG` / `SET_CONFIG` parameter list as it crosses the ABI.
#[repr(C)]
pub struct SConfigList {
    pub num_of_params: u32,
    pub config_ptr: *mut SConfig,
}

fn status(result: Result<(), ErrorCode>) -> i32 {
    match result {
        Ok(()) => STATUS_NOERROR,
        Err(code) => code.code() as i32,
    }
}

/// Run `body`, converting a panic into `ERR_FAILED`.
fn guarded(body: impl FnOnce() -> i32 + UnwindSafe) -> i32 {
    match catch_unwind(body) {
        Ok(code) => code,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            DeviceManager::global().set_last_error(format!("internal fault: {message}"));
            ErrorCode::Failed.code() as i32
        }
    }
}

fn null_parameter(what: &str) -> i32 {
    DeviceManager::global().set_last_error(format!("null parameter: {what}"));
    ErrorCode::NullParameter.code() as i32
}

/// Copy `text` into an 80-byte caller buffer, truncated and
/// NUL-terminated.
unsafe fn write_string(dest: *mut c_char, text: &str) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(STRING_BUFFER_LEN - 1);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest as *mut u8, len);
        *dest.add(len) = 0;
    }
}

#[no_mangle]
pub extern "system" fn PassThruOpen(name: *const c_void, device_id: *mut u32) -> i32 {
    guarded(|| {
        if device_id.is_null() {
            return null_parameter("device ID");
        }
        let name = if name.is_null() {
            String::new()
        } else {
            unsafe { std::ffi::CStr::from_ptr(name as *const c_char) }
                .to_string_lossy()
                .into_owned()
        };
        match DeviceManager::global().open_device(&name) {
            Ok(id) => {
                unsafe { *device_id = id };
                STATUS_NOERROR
            }
            Err(code) => code.code() as i32,
        }
    })
}

#[no_mangle]
pub extern "system" fn PassThruClose(device_id: u32) -> i32 {
    guarded(|| status(DeviceManager::global().close_device(device_id)))
}

#[no_mangle]
pub extern "system" fn PassThruConnect(
    device_id: u32,
    protocol_id: u32,
    flags: u32,
    baudrate: u32,
    channel_id: *mut u32,
) -> i32 {
    guarded(|| {
        if channel_id.is_null() {
            return null_parameter("channel ID");
        }
        match DeviceManager::global().connect(device_id, protocol_id, flags, baudrate) {
            Ok(id) => {
                unsafe { *channel_id = id };
                STATUS_NOERROR
            }
            Err(code) => code.code() as i32,
        }
    })
}

#[no_mangle]
pub extern "system" fn PassThruDisconnect(channel_id: u32) -> i32 {
    guarded(|| status(DeviceManager::global().disconnect(channel_id)))
}

#[no_mangle]
pub extern "system" fn PassThruReadMsgs(
    channel_id: u32,
    msgs: *mut PassThruMsg,
    num_msgs: *mut u32,
    timeout_ms: u32,
) -> i32 {
    guarded(|| {
        if msgs.is_null() || num_msgs.is_null() {
            return null_parameter("message buffer");
        }
        let requested = unsafe { *num_msgs } as usize;
        unsafe { *num_msgs = 0 };
        match DeviceManager::global().read_msgs(channel_id, requested, timeout_ms) {
            Ok(read) => {
                for (index, msg) in read.iter().enumerate() {
                    unsafe { *msgs.add(index) = *msg };
                }
                unsafe { *num_msgs = read.len() as u32 };
                STATUS_NOERROR
            }
            Err(code) => code.code() as i32,
        }
    })
}

#[no_mangle]
pub extern "system" fn PassThruWriteMsgs(
    channel_id: u32,
    msgs: *const PassThruMsg,
    num_msgs: *mut u32,
    timeout_ms: u32,
) -> i32 {
    guarded(|| {
        if msgs.is_null() || num_msgs.is_null() {
            return null_parameter("message buffer");
        }
        let requested = unsafe { *num_msgs } as usize;
        let input = unsafe { std::slice::from_raw_parts(msgs, requested) };
        let mut written = 0;
        let result = DeviceManager::global().write_msgs(channel_id, input, timeout_ms, &mut written);
        unsafe { *num_msgs = written };
        status(result)
    })
}

#[no_mangle]
pub extern "system" fn PassThruStartPeriodicMsg(
    channel_id: u32,
    msg: *const PassThruMsg,
    msg_id: *mut u32,
    time_interval_ms: u32,
) -> i32 {
    guarded(|| {
        if msg.is_null() || msg_id.is_null() {
            return null_parameter("periodic message");
        }
        let msg = unsafe { &*msg };
        match DeviceManager::global().start_periodic_msg(channel_id, msg, time_interval_ms) {
            Ok(id) => {
                unsafe { *msg_id = id };
                STATUS_NOERROR
            }
            Err(code) => code.code() as i32,
        }
    })
}

#[no_mangle]
pub extern "system" fn PassThruStopPeriodicMsg(channel_id: u32, msg_id: u32) -> i32 {
    guarded(|| status(DeviceManager::global().stop_periodic_msg(channel_id, msg_id)))
}

#[no_mangle]
pub extern "system" fn PassThruStartMsgFilter(
    channel_id: u32,
    filter_type: u32,
    mask_msg: *const PassThruMsg,
    pattern_msg: *const PassThruMsg,
    flow_control_msg: *const PassThruMsg,
    filter_id: *mut u32,
) -> i32 {
    guarded(|| {
        if mask_msg.is_null() || pattern_msg.is_null() || filter_id.is_null() {
            return null_parameter("filter message");
        }
        let mask = unsafe { &*mask_msg };
        let pattern = unsafe { &*pattern_msg };
        let flow_control = if flow_control_msg.is_null() {
            None
        } else {
            Some(unsafe { &*flow_control_msg })
        };
        match DeviceManager::global().start_msg_filter(
            channel_id,
            filter_type,
            mask,
            pattern,
            flow_control,
        ) {
            Ok(id) => {
                unsafe { *filter_id = id };
                STATUS_NOERROR
            }
            Err(code) => code.code() as i32,
        }
    })
}

#[no_mangle]
pub extern "system" fn PassThruStopMsgFilter(channel_id: u32, filter_id: u32) -> i32 {
    guarded(|| status(DeviceManager::global().stop_msg_filter(channel_id, filter_id)))
}

#[no_mangle]
pub extern "system" fn PassThruSetProgrammingVoltage(
    _device_id: u32,
    _pin_number: u32,
    _voltage: u32,
) -> i32 {
    guarded(|| {
        DeviceManager::global().set_last_error("programming voltage not supported");
        ErrorCode::NotSupported.code() as i32
    })
}

#[no_mangle]
pub extern "system" fn PassThruReadVersion(
    device_id: u32,
    firmware_version: *mut c_char,
    dll_version: *mut c_char,
    api_version: *mut c_char,
) -> i32 {
    guarded(|| {
        if firmware_version.is_null() || dll_version.is_null() || api_version.is_null() {
            return null_parameter("version buffer");
        }
        match DeviceManager::global().read_version(device_id) {
            Ok((firmware, dll, api)) => {
                unsafe {
                    write_string(firmware_version, &firmware);
                    write_string(dll_version, &dll);
                    write_string(api_version, &api);
                }
                STATUS_NOERROR
            }
            Err(code) => code.code() as i32,
        }
    })
}

#[no_mangle]
pub extern "system" fn PassThruGetLastError(error_description: *mut c_char) -> i32 {
    guarded(|| {
        if error_description.is_null() {
            return ErrorCode::NullParameter.code() as i32;
        }
        let message = DeviceManager::global().last_error();
        unsafe { write_string(error_description, &message) };
        STATUS_NOERROR
    })
}

#[no_mangle]
pub extern "system" fn PassThruIoctl(
    channel_id: u32,
    ioctl_id: u32,
    input: *const c_void,
    output: *mut c_void,
) -> i32 {
    guarded(|| {
        let manager = DeviceManager::global();
        match ioctl_id {
            ioctl::GET_CONFIG => {
                if input.is_null() {
                    return null_parameter("config list");
                }
                // Per the published API the values are written back into
                // the caller's own list.
                let list = unsafe { &*(input as *const SConfigList) };
                if list.config_ptr.is_null() {
                    return null_parameter("config pointer");
                }
                let params = unsafe {
                    std::slice::from_raw_parts_mut(list.config_ptr, list.num_of_params as usize)
                };
                status(manager.get_config(channel_id, params))
            }
            ioctl::SET_CONFIG => {
                if input.is_null() {
                    return null_parameter("config list");
                }
                let list = unsafe { &*(input as *const SConfigList) };
                if list.config_ptr.is_null() {
                    return null_parameter("config pointer");
                }
                let params = unsafe {
                    std::slice::from_raw_parts(list.config_ptr, list.num_of_params as usize)
                };
                status(manager.set_config(channel_id, params))
            }
            ioctl::READ_VBATT | ioctl::READ_PROG_VOLTAGE => {
                if output.is_null() {
                    return null_parameter("voltage output");
                }
                match manager.read_vbatt(channel_id) {
                    Ok(millivolts) => {
                        unsafe { *(output as *mut u32) = millivolts };
                        STATUS_NOERROR
                    }
                    Err(code) => code.code() as i32,
                }
            }
            ioctl::CLEAR_TX_BUFFER => status(manager.clear_tx_buffer(channel_id)),
            ioctl::CLEAR_RX_BUFFER => status(manager.clear_rx_buffer(channel_id)),
            ioctl::CLEAR_PERIODIC_MSGS => status(manager.clear_periodic_msgs(channel_id)),
            ioctl::CLEAR_MSG_FILTERS => status(manager.clear_msg_filters(channel_id)),
            _ => {
                manager.set_last_error("ioctl not supported");
                ErrorCode::InvalidIoctlId.code() as i32
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    /// The ABI shares one global manager (and last-error slot); serialize
    /// the tests that touch it.
    fn serial() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn null_parameters_are_rejected() {
        let _guard = serial();
        assert_eq!(
            PassThruOpen(std::ptr::null(), std::ptr::null_mut()),
            ErrorCode::NullParameter.code() as i32
        );
        assert_eq!(
            PassThruReadMsgs(1, std::ptr::null_mut(), std::ptr::null_mut(), 0),
            ErrorCode::NullParameter.code() as i32
        );
        assert_eq!(
            PassThruGetLastError(std::ptr::null_mut()),
            ErrorCode::NullParameter.code() as i32
        );
    }

    #[test]
    fn unknown_channel_ids_translate_to_status_codes() {
        let _guard = serial();
        assert_eq!(
            PassThruDisconnect(0xDEAD),
            ErrorCode::InvalidChannelId.code() as i32
        );
        assert_eq!(
            PassThruStopMsgFilter(0xDEAD, 1),
            ErrorCode::InvalidChannelId.code() as i32
        );
    }

    #[test]
    fn last_error_is_truncated_and_nul_terminated() {
        let _guard = serial();
        DeviceManager::global().set_last_error("x".repeat(200));
        let mut buffer: [c_char; STRING_BUFFER_LEN] = [0; STRING_BUFFER_LEN];
        assert_eq!(PassThruGetLastError(buffer.as_mut_ptr()), STATUS_NOERROR);
        let text = unsafe { std::ffi::CStr::from_ptr(buffer.as_ptr()) };
        assert_eq!(text.to_bytes().len(), STRING_BUFFER_LEN - 1);
    }

    #[test]
    fn unknown_ioctl_ids_are_rejected() {
        let _guard = serial();
        assert_eq!(
            PassThruIoctl(1, 0x7777, std::ptr::null(), std::ptr::null_mut()),
            ErrorCode::InvalidIoctlId.code() as i32
        );
    }

    #[test]
    fn programming_voltage_is_not_supported() {
        let _guard = serial();
        assert_eq!(
            PassThruSetProgrammingVoltage(1, 15, 5000),
            ErrorCode::NotSupported.code() as i32
        );
    }
}
