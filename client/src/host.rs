use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use gloo_timers::future::TimeoutFuture;
use js_sys::Function;
use serde::Serialize;
use tracing::{debug, warn};
use wasm_bindgen::JsValue;
use wasm_bindgen_futures::spawn_local;
use web_sys::AbortController;

use slidescope_engine::{
    FetchError, FetchRequest, FetchTicket, FrameHost, FrameStats, Renderer, SchedulerSnapshot,
    TileFailure, ViewState,
};

use crate::fetch::fetch_tile;
use crate::gpu::WgpuDevice;
use crate::render_loop::AnimationFrame;

/// Everything one viewer owns. Split borrows of the three parts let the
/// renderer drive the device and host in the same call.
pub struct ViewerState {
    pub renderer: Renderer,
    pub device: WgpuDevice,
    pub host: BrowserHost,
}

pub type SharedState = Rc<RefCell<ViewerState>>;

/// JS callbacks registered through the viewer facade.
#[derive(Default)]
pub struct Callbacks {
    pub on_stats: Option<Function>,
    pub on_scheduler: Option<Function>,
    pub on_tile_error: Option<Function>,
    pub on_view_change: Option<Function>,
    pub on_context_lost: Option<Function>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TileErrorEvent<'a> {
    tier: u8,
    x: u32,
    y: u32,
    url: &'a str,
    error: String,
    status: Option<u16>,
    attempt_count: u32,
}

impl<'a> From<&'a TileFailure> for TileErrorEvent<'a> {
    fn from(failure: &'a TileFailure) -> Self {
        Self {
            tier: failure.tile.tier(),
            x: failure.tile.x(),
            y: failure.tile.y(),
            url: &failure.tile.url,
            error: failure.error.to_string(),
            status: match failure.error {
                FetchError::Http { status } => Some(status),
                _ => None,
            },
            attempt_count: failure.attempt_count,
        }
    }
}

/// `FrameHost` for the browser: fetches run as spawned futures, retry
/// wake-ups as gloo timers, frames on `requestAnimationFrame`.
pub struct BrowserHost {
    state: Weak<RefCell<ViewerState>>,
    frame: AnimationFrame,
    controllers: HashMap<FetchTicket, AbortController>,
    /// Bumped per `wake_at`; a timer whose serial is stale does nothing.
    wake_serial: Rc<Cell<u64>>,
    pub callbacks: Callbacks,
}

impl BrowserHost {
    pub fn new(state: Weak<RefCell<ViewerState>>) -> Self {
        let frame_state = state.clone();
        let frame = AnimationFrame::new(move |timestamp| {
            let Some(state) = frame_state.upgrade() else {
                return;
            };
            let Ok(mut guard) = state.try_borrow_mut() else {
                warn!("animation frame skipped: viewer busy");
                return;
            };
            let ViewerState {
                renderer,
                device,
                host,
            } = &mut *guard;
            renderer.tick(timestamp, device, host);
        });
        Self {
            state,
            frame,
            controllers: HashMap::new(),
            wake_serial: Rc::new(Cell::new(0)),
            callbacks: Callbacks::default(),
        }
    }

    /// Abort every outstanding request and stop timers and frames.
    pub fn shutdown(&mut self) {
        for (_, controller) in self.controllers.drain() {
            controller.abort();
        }
        self.wake_serial.set(self.wake_serial.get() + 1);
        self.frame.cancel();
    }

    fn emit(callback: &Option<Function>, value: Result<JsValue, serde_wasm_bindgen::Error>) {
        let Some(callback) = callback else {
            return;
        };
        match value {
            Ok(value) => {
                if let Err(err) = callback.call1(&JsValue::NULL, &value) {
                    warn!(?err, "viewer callback threw");
                }
            }
            Err(err) => warn!(%err, "failed to serialize callback payload"),
        }
    }
}

pub fn now_ms() -> f64 {
    web_sys::window()
        .and_then(|w| w.performance())
        .map(|p| p.now())
        .unwrap_or(0.0)
}

impl FrameHost for BrowserHost {
    fn start_fetch(&mut self, request: FetchRequest) {
        let controller = AbortController::new()
            .inspect_err(|err| warn!(?err, "AbortController unavailable, fetch is not abortable"))
            .ok();
        let signal = controller.as_ref().map(AbortController::signal);
        let FetchRequest {
            ticket,
            url,
            attempt,
            auth_token,
        } = request;
        debug!(tile = %ticket.key, attempt, "fetching tile");
        if let Some(controller) = controller {
            self.controllers.insert(ticket, controller);
        }

        let state = self.state.clone();
        spawn_local(async move {
            let result = fetch_tile(&url, auth_token.as_deref(), signal.as_ref()).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let Ok(mut guard) = state.try_borrow_mut() else {
                warn!(tile = %ticket.key, "fetch result dropped: viewer busy");
                return;
            };
            let ViewerState {
                renderer,
                device,
                host,
            } = &mut *guard;
            host.controllers.remove(&ticket);
            let now = now_ms();
            match result {
                Ok(image) => renderer.fetch_succeeded(ticket, image, now, device, host),
                Err(error) => renderer.fetch_failed(ticket, error, now, host),
            }
        });
    }

    fn cancel_fetch(&mut self, ticket: FetchTicket) {
        if let Some(controller) = self.controllers.remove(&ticket) {
            controller.abort();
        }
    }

    fn wake_at(&mut self, deadline_ms: f64) {
        let serial = self.wake_serial.get() + 1;
        self.wake_serial.set(serial);
        let delay = (deadline_ms - now_ms()).max(0.0).ceil() as u32;

        let wake_serial = self.wake_serial.clone();
        let state = self.state.clone();
        spawn_local(async move {
            TimeoutFuture::new(delay).await;
            if wake_serial.get() != serial {
                return;
            }
            let Some(state) = state.upgrade() else {
                return;
            };
            let Ok(mut guard) = state.try_borrow_mut() else {
                warn!("retry wake-up dropped: viewer busy");
                return;
            };
            let ViewerState { renderer, host, .. } = &mut *guard;
            renderer.poll(now_ms(), host);
        });
    }

    fn request_frame(&mut self) {
        self.frame.request();
    }

    fn on_stats(&mut self, stats: &FrameStats) {
        Self::emit(&self.callbacks.on_stats, serde_wasm_bindgen::to_value(stats));
    }

    fn on_scheduler(&mut self, snapshot: &SchedulerSnapshot) {
        Self::emit(
            &self.callbacks.on_scheduler,
            serde_wasm_bindgen::to_value(snapshot),
        );
    }

    fn on_tile_error(&mut self, failure: &TileFailure) {
        Self::emit(
            &self.callbacks.on_tile_error,
            serde_wasm_bindgen::to_value(&TileErrorEvent::from(failure)),
        );
    }

    fn on_view_change(&mut self, view: &ViewState) {
        Self::emit(
            &self.callbacks.on_view_change,
            serde_wasm_bindgen::to_value(view),
        );
    }

    fn on_context_lost(&mut self) {
        if let Some(callback) = &self.callbacks.on_context_lost
            && let Err(err) = callback.call0(&JsValue::NULL)
        {
            warn!(?err, "viewer callback threw");
        }
    }
}
