//! Hidden-window message pump for `WM_SETTINGCHANGE` broadcasts.

use std::ffi::c_void;

use tokio::sync::{mpsc, oneshot};

use accentsync_core::prelude::*;

use windows::core::{w, PCWSTR};
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DispatchMessageW, GetMessageW, GetWindowLongPtrW,
    RegisterClassW, SetWindowLongPtrW, TranslateMessage, CREATESTRUCTW, GWLP_USERDATA, MSG,
    WM_CREATE, WM_SETTINGCHANGE, WNDCLASSW, WS_OVERLAPPED,
};

use super::{is_accent_setting, ThemeSignal};

/// State handed to the window proc through the create parameter.
struct PumpShared {
    signal_tx: mpsc::Sender<ThemeSignal>,
}

/// Thread body: register the class, create the hidden window, report the
/// outcome through `ready_tx`, then pump messages until the window dies.
pub(super) fn run_message_pump(
    signal_tx: mpsc::Sender<ThemeSignal>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let shared_ptr = Box::into_raw(Box::new(PumpShared { signal_tx }));

    match unsafe { create_listener_window(shared_ptr as *const c_void) } {
        Ok(_hwnd) => {
            // Sync send into a oneshot; the receiving side is async.
            let _ = ready_tx.send(Ok(()));
        }
        Err(err) => {
            // The window never existed, so WM_CREATE never ran; reclaim here.
            drop(unsafe { Box::from_raw(shared_ptr) });
            let _ = ready_tx.send(Err(err));
            return;
        }
    }

    unsafe {
        let mut msg = MSG::default();
        loop {
            let ret = GetMessageW(&mut msg, None, 0, 0);
            if ret.0 <= 0 {
                break; // WM_QUIT or an error
            }
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    // Normally unreachable before process exit; reclaiming the shared state
    // drops the sender, which the engine sees as a closed channel.
    drop(unsafe { Box::from_raw(shared_ptr) });
    debug!("Setting-change pump exited");
}

unsafe fn create_listener_window(create_param: *const c_void) -> Result<HWND> {
    let instance = GetModuleHandleW(None)
        .map_err(|err| Error::listener(format!("GetModuleHandleW failed: {err}")))?;

    let class_name = w!("AccentSyncListener");
    let wc = WNDCLASSW {
        lpfnWndProc: Some(listener_wndproc),
        hInstance: instance.into(),
        lpszClassName: class_name,
        ..Default::default()
    };

    if RegisterClassW(&wc) == 0 {
        return Err(Error::listener(format!(
            "RegisterClassW failed: {}",
            windows::core::Error::from_win32()
        )));
    }

    // A hidden top-level window, deliberately not message-only:
    // WM_SETTINGCHANGE is a broadcast, and broadcasts are not delivered to
    // message-only windows.
    CreateWindowExW(
        Default::default(),
        class_name,
        w!("accent-sync settings listener"),
        WS_OVERLAPPED,
        0,
        0,
        0,
        0,
        None,
        None,
        Some(instance.into()),
        Some(create_param),
    )
    .map_err(|err| Error::listener(format!("CreateWindowExW failed: {err}")))
}

unsafe extern "system" fn listener_wndproc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match msg {
        WM_CREATE => {
            // Stash the create param where WM_SETTINGCHANGE can reach it.
            let create = lparam.0 as *const CREATESTRUCTW;
            if let Some(create) = create.as_ref() {
                SetWindowLongPtrW(hwnd, GWLP_USERDATA, create.lpCreateParams as isize);
            }
            LRESULT(0)
        }
        WM_SETTINGCHANGE => {
            let shared = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *const PumpShared;
            if let Some(shared) = shared.as_ref() {
                handle_setting_change(shared, lparam);
            }
            LRESULT(0)
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

/// Decode the lparam setting name and forward a signal when it matches.
unsafe fn handle_setting_change(shared: &PumpShared, lparam: LPARAM) {
    if lparam.0 == 0 {
        return; // broadcasts without a setting name are not ours
    }
    let Ok(setting) = PCWSTR(lparam.0 as *const u16).to_string() else {
        return;
    };
    if !is_accent_setting(&setting) {
        return;
    }

    trace!("WM_SETTINGCHANGE: {}", setting);
    // Blocking send from the pump thread: a slow consumer delays the pump
    // rather than losing the notification.
    if shared.signal_tx.blocking_send(ThemeSignal).is_err() {
        debug!("Signal channel closed; dropping setting change");
    }
}
