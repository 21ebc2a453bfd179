/// Windows window/keyboard integration.
///
/// Both hooks (`SetWinEventHook` for foreground changes, `WH_KEYBOARD_LL` for
/// keystrokes) run on a dedicated OS thread with its own message pump. The
/// thread is stopped by posting `WM_QUIT`, which ends the pump and removes the
/// hook.
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use windows::Win32::Foundation::{HMODULE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::Accessibility::{SetWinEventHook, UnhookWinEvent, HWINEVENTHOOK};
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, DispatchMessageW, GetForegroundWindow, GetMessageW, GetWindowTextLengthW,
    GetWindowTextW, GetWindowThreadProcessId, PostThreadMessageW, SetWindowsHookExW,
    UnhookWindowsHookEx, EVENT_SYSTEM_FOREGROUND, MSG, WH_KEYBOARD_LL,
    WINEVENT_OUTOFCONTEXT, WM_KEYDOWN, WM_KEYUP, WM_QUIT, WM_SYSKEYDOWN, WM_SYSKEYUP,
};

use super::{executable_path_for_pid, ActiveWindow, KeyEvent, KeyListener, WindowSource};
use crate::error::WindowQueryError;
use crate::event::DaemonEvent;

/// Channels the hook callbacks forward into. Set once by the constructors.
static FOCUS_TX: OnceLock<mpsc::Sender<DaemonEvent>> = OnceLock::new();
static KEY_TX: OnceLock<mpsc::Sender<DaemonEvent>> = OnceLock::new();

// ── Message pump threads ──────────────────────────────────────────────────────

struct PumpThread {
    handle: JoinHandle<()>,
    thread_id: u32,
}

impl PumpThread {
    /// Spawns a thread that runs `install`, pumps messages until `WM_QUIT`, and
    /// then runs `uninstall`. Returns once the hook is in place.
    fn spawn<H, I, U>(name: &str, install: I, uninstall: U) -> Result<Self, String>
    where
        I: FnOnce() -> Result<H, String> + Send + 'static,
        U: FnOnce(H) + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<u32, String>>(1);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let hook = match install() {
                    Ok(hook) => hook,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(unsafe { GetCurrentThreadId() }));
                drop(ready_tx);

                let mut msg = MSG::default();
                // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
                while unsafe { GetMessageW(&mut msg, None, 0, 0) }.0 > 0 {
                    unsafe {
                        DispatchMessageW(&msg);
                    }
                }
                uninstall(hook);
            })
            .map_err(|e| format!("failed to spawn hook thread: {e}"))?;

        match ready_rx.recv() {
            Ok(Ok(thread_id)) => Ok(Self { handle, thread_id }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err("hook thread exited before installing its hook".to_string()),
        }
    }

    /// Posts `WM_QUIT` and waits for the thread to remove its hook.
    fn stop(self) -> Result<(), String> {
        unsafe { PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0)) }
            .map_err(|e| e.to_string())?;
        self.handle.join().map_err(|_| "hook thread panicked".to_string())
    }
}

// ── Foreground window ─────────────────────────────────────────────────────────

/// Describes `hwnd`: owning pid, executable, and title.
fn describe_window(hwnd: HWND) -> Result<ActiveWindow, WindowQueryError> {
    if hwnd == HWND::default() {
        return Err(WindowQueryError::NoForegroundWindow);
    }

    let mut pid = 0u32;
    unsafe { GetWindowThreadProcessId(hwnd, Some(&mut pid as *mut u32)) };
    if pid == 0 {
        return Err(WindowQueryError::Os("window has no owning process".to_string()));
    }

    let len = unsafe { GetWindowTextLengthW(hwnd) };
    let mut buf = vec![0u16; usize::try_from(len).unwrap_or(0) + 1];
    let copied = unsafe { GetWindowTextW(hwnd, &mut buf) };
    let copied = usize::try_from(copied).unwrap_or(0).min(buf.len());

    Ok(ActiveWindow {
        process_id: pid,
        executable_path: executable_path_for_pid(pid),
        title: String::from_utf16_lossy(&buf[..copied]),
    })
}

unsafe extern "system" fn foreground_proc(
    _hook: HWINEVENTHOOK,
    _event: u32,
    hwnd: HWND,
    _id_object: i32,
    _id_child: i32,
    _event_thread: u32,
    _event_time: u32,
) {
    match describe_window(hwnd) {
        Ok(window) => {
            if let Some(tx) = FOCUS_TX.get() {
                // A full channel drops this change; the next one carries fresh state.
                let _ = tx.try_send(DaemonEvent::FocusChanged(window));
            }
        }
        Err(e) => debug!(error = %e, "Ignoring foreground change"),
    }
}

pub struct ForegroundWindowSource {
    pump: Option<PumpThread>,
}

impl ForegroundWindowSource {
    pub fn new(tx: mpsc::Sender<DaemonEvent>) -> Self {
        let _ = FOCUS_TX.set(tx);
        Self { pump: None }
    }
}

impl WindowSource for ForegroundWindowSource {
    fn subscribe(&mut self) -> Result<(), WindowQueryError> {
        if self.pump.is_some() {
            return Ok(());
        }
        let pump = PumpThread::spawn(
            "focus-pump",
            || {
                let hook = unsafe {
                    SetWinEventHook(
                        EVENT_SYSTEM_FOREGROUND,
                        EVENT_SYSTEM_FOREGROUND,
                        HMODULE::default(),
                        Some(foreground_proc),
                        0,
                        0,
                        WINEVENT_OUTOFCONTEXT,
                    )
                };
                if hook == HWINEVENTHOOK::default() {
                    Err("SetWinEventHook failed".to_string())
                } else {
                    Ok(hook)
                }
            },
            |hook| {
                let _ = unsafe { UnhookWinEvent(hook) };
            },
        )
        .map_err(WindowQueryError::Os)?;
        self.pump = Some(pump);
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<(), WindowQueryError> {
        match self.pump.take() {
            Some(pump) => pump.stop().map_err(WindowQueryError::Os),
            None => Ok(()),
        }
    }

    fn active_window(&self) -> Result<ActiveWindow, WindowQueryError> {
        describe_window(unsafe { GetForegroundWindow() })
    }
}

// ── Keyboard ──────────────────────────────────────────────────────────────────

/// Low-level keyboard hook procedure. Forwards every key transition; filtering
/// is the watcher's job.
unsafe extern "system" fn keyboard_proc(n_code: i32, w_param: WPARAM, l_param: LPARAM) -> LRESULT {
    if n_code >= 0 {
        let event = match u32::try_from(w_param.0) {
            Ok(WM_KEYDOWN | WM_SYSKEYDOWN) => Some(KeyEvent::Down),
            Ok(WM_KEYUP | WM_SYSKEYUP) => Some(KeyEvent::Up),
            _ => None,
        };
        if let (Some(event), Some(tx)) = (event, KEY_TX.get()) {
            // try_send is non-blocking; a full channel silently drops this key.
            let _ = tx.try_send(DaemonEvent::Key(event));
        }
    }
    CallNextHookEx(None, n_code, w_param, l_param)
}

pub struct LowLevelKeyListener {
    pump: Option<PumpThread>,
}

impl LowLevelKeyListener {
    pub fn new(tx: mpsc::Sender<DaemonEvent>) -> Self {
        let _ = KEY_TX.set(tx);
        Self { pump: None }
    }
}

impl KeyListener for LowLevelKeyListener {
    fn attach(&mut self) -> anyhow::Result<()> {
        if self.pump.is_some() {
            return Ok(());
        }
        let pump = PumpThread::spawn(
            "keyboard-pump",
            || {
                unsafe { SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_proc), None, 0) }
                    .map_err(|e| format!("SetWindowsHookExW failed: {e}"))
            },
            |hook| {
                let _ = unsafe { UnhookWindowsHookEx(hook) };
            },
        )
        .map_err(anyhow::Error::msg)?;
        self.pump = Some(pump);
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.stop() {
                warn!(error = %e, "Keyboard hook did not shut down cleanly");
            }
        }
    }
}
