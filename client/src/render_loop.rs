use std::cell::{Cell, RefCell};
use std::rc::Rc;

use wasm_bindgen::prelude::*;

/// One-shot `requestAnimationFrame` wrapper.
///
/// `request()` arms at most one callback; requests made while one is armed
/// are absorbed. Request coalescing also happens in the engine's `FramePacer`;
/// the callback always runs the frame function with the rAF timestamp.
pub struct AnimationFrame {
    inner: Rc<Inner>,
}

struct Inner {
    window: Option<web_sys::Window>,
    raf_id: Cell<Option<i32>>,
    callback: RefCell<Option<Closure<dyn FnMut(f64)>>>,
}

impl AnimationFrame {
    pub fn new(mut on_frame: impl FnMut(f64) + 'static) -> Self {
        let inner = Rc::new(Inner {
            window: web_sys::window(),
            raf_id: Cell::new(None),
            callback: RefCell::new(None),
        });

        let inner_cb = inner.clone();
        let cb = Closure::<dyn FnMut(f64)>::new(move |timestamp: f64| {
            inner_cb.raf_id.set(None);
            on_frame(timestamp);
        });
        *inner.callback.borrow_mut() = Some(cb);

        Self { inner }
    }

    /// Arm a callback for the next frame. Returns `false` if one was already
    /// armed or the window is unavailable.
    pub fn request(&self) -> bool {
        if self.inner.raf_id.get().is_some() {
            return false;
        }
        let Some(window) = self.inner.window.as_ref() else {
            return false;
        };
        let cb_ref = self.inner.callback.borrow();
        let Some(cb) = cb_ref.as_ref() else {
            return false;
        };
        match window.request_animation_frame(cb.as_ref().unchecked_ref()) {
            Ok(id) => {
                self.inner.raf_id.set(Some(id));
                true
            }
            Err(_) => false,
        }
    }

    pub fn cancel(&self) {
        if let Some(raf_id) = self.inner.raf_id.replace(None)
            && let Some(window) = self.inner.window.as_ref()
        {
            let _ = window.cancel_animation_frame(raf_id);
        }
    }
}

impl Drop for AnimationFrame {
    fn drop(&mut self) {
        self.cancel();
        // Break the callback->inner reference cycle on teardown.
        self.inner.callback.borrow_mut().take();
    }
}
