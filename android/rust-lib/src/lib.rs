use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use jni::objects::{GlobalRef, JClass, JObject, JString};
use jni::sys::{jboolean, jint, JNI_FALSE, JNI_TRUE};
use jni::{JNIEnv, JavaVM};

use h2tun::engine::ProtocolEngine;
use h2tun::error::{AppError, Result};
use h2tun::profile::TunnelProfile;
use h2tun::tunnel::{
    InterfaceHandle, InterfaceParams, InterfaceProvider, Orchestrator, TunnelSettings, TunnelState,
};

const RELAY_LIB: &str = "libtun2socks.so";

static BRIDGE: Mutex<Option<Arc<Orchestrator>>> = Mutex::new(None);

/// The VpnService instance the orchestrator calls back into.
#[derive(Clone)]
struct Service {
    jvm: Arc<JavaVM>,
    service: GlobalRef,
}

impl Service {
    fn with_env<T>(
        &self,
        f: impl FnOnce(&mut JNIEnv, &JObject) -> jni::errors::Result<T>,
    ) -> std::result::Result<T, String> {
        let mut env = self
            .jvm
            .attach_current_thread()
            .map_err(|e| format!("attach_current_thread failed: {e}"))?;
        let result = f(&mut *env, self.service.as_obj());
        if env.exception_check().unwrap_or(false) {
            let _ = env.exception_describe();
            let _ = env.exception_clear();
        }
        result.map_err(|e| e.to_string())
    }
}

/// `int establish(String paramsJson)`: the service builds the interface and
/// returns a detached descriptor, or a negative value.
struct JniInterfaces(Service);

impl InterfaceProvider for JniInterfaces {
    fn establish(&self, params: &InterfaceParams) -> Result<InterfaceHandle> {
        let params_json = serde_json::to_string(params)?;
        let fd = self
            .0
            .with_env(|env, service| {
                let arg: JObject = env.new_string(&params_json)?.into();
                env.call_method(service, "establish", "(Ljava/lang/String;)I", &[(&arg).into()])?
                    .i()
            })
            .map_err(|e| AppError::Interface(format!("establish failed: {e}")))?;
        if fd < 0 {
            return Err(AppError::Interface(format!("establish returned {fd}")));
        }
        // SAFETY: the service detached this descriptor and hands ownership to us.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(InterfaceHandle::new("vpn", fd))
    }
}

/// `boolean startEngine(String config)` / `void stopEngine()`.
struct JniEngine(Service);

impl ProtocolEngine for JniEngine {
    fn start(&self, config: &str) -> Result<()> {
        let started = self
            .0
            .with_env(|env, service| {
                let arg: JObject = env.new_string(config)?.into();
                env.call_method(service, "startEngine", "(Ljava/lang/String;)Z", &[(&arg).into()])?
                    .z()
            })
            .map_err(AppError::ProtocolEngine)?;
        if started {
            Ok(())
        } else {
            Err(AppError::ProtocolEngine("startEngine returned false".to_string()))
        }
    }

    fn stop(&self) -> Result<()> {
        self.0
            .with_env(|env, service| env.call_method(service, "stopEngine", "()V", &[]).map(|_| ()))
            .map_err(AppError::ProtocolEngine)
    }
}

/// Runs with the state machine locked, so `onStateChanged` must not call back
/// into `nativeState`/`nativeStart` synchronously; post to a handler instead.
fn notify_state(service: &Service, state: TunnelState) {
    let code = state.code();
    if let Err(e) = service.with_env(|env, obj| {
        env.call_method(obj, "onStateChanged", "(I)V", &[jni::objects::JValue::Int(code)])
            .map(|_| ())
    }) {
        log::warn!("onStateChanged({}) failed: {}", state, e);
    }
}

fn current() -> Option<Arc<Orchestrator>> {
    BRIDGE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn initialize(
    env: &mut JNIEnv,
    vpn_service: &JObject,
    files_dir: &JString,
    native_lib_dir: &JString,
) -> std::result::Result<Orchestrator, String> {
    let files_dir: String = env
        .get_string(files_dir)
        .map_err(|e| format!("filesDir: {e}"))?
        .into();
    let native_lib_dir: String = env
        .get_string(native_lib_dir)
        .map_err(|e| format!("nativeLibDir: {e}"))?
        .into();
    let package = env
        .call_method(vpn_service, "getPackageName", "()Ljava/lang/String;", &[])
        .and_then(|v| v.l())
        .map_err(|e| format!("getPackageName: {e}"))?;
    let package: String = env
        .get_string(&JString::from(package))
        .map_err(|e| format!("getPackageName: {e}"))?
        .into();

    let service = Service {
        jvm: Arc::new(env.get_java_vm().map_err(|e| format!("get_java_vm: {e}"))?),
        service: env
            .new_global_ref(vpn_service)
            .map_err(|e| format!("new_global_ref: {e}"))?,
    };

    let relay = PathBuf::from(native_lib_dir).join(RELAY_LIB);
    let settings = TunnelSettings::new(files_dir, relay, &package);
    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(JniInterfaces(service.clone())),
        Arc::new(JniEngine(service.clone())),
    );
    orchestrator.subscribe(Arc::new(move |state: TunnelState| notify_state(&service, state)));
    Ok(orchestrator)
}

#[no_mangle]
pub extern "system" fn Java_org_h2tun_TunnelService_nativeInitialize(
    mut env: JNIEnv,
    _class: JClass,
    vpn_service: JObject,
    files_dir: JString,
    native_lib_dir: JString,
) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Debug)
            .with_tag("h2tun"),
    );

    match initialize(&mut env, &vpn_service, &files_dir, &native_lib_dir) {
        Ok(orchestrator) => {
            let previous = BRIDGE
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(Arc::new(orchestrator));
            if let Some(previous) = previous {
                retire(previous);
            }
            log::info!("h2tun native initialized");
        }
        Err(e) => log::error!("nativeInitialize failed: {}", e),
    }
}

#[no_mangle]
pub extern "system" fn Java_org_h2tun_TunnelService_nativeStart(
    mut env: JNIEnv,
    _class: JClass,
    profile_json: JString,
) -> jboolean {
    let Some(orchestrator) = current() else {
        log::error!("nativeStart: not initialized");
        return JNI_FALSE;
    };
    let profile_json: String = match env.get_string(&profile_json) {
        Ok(s) => s.into(),
        Err(_) => return JNI_FALSE,
    };
    let profile: TunnelProfile = match serde_json::from_str(&profile_json) {
        Ok(p) => p,
        Err(e) => {
            log::error!("nativeStart: bad profile: {}", e);
            return JNI_FALSE;
        }
    };
    if orchestrator.request_start(profile) {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// Dropping an orchestrator waits for its teardown; do that off the caller's
/// (UI) thread.
fn retire(previous: Arc<Orchestrator>) {
    let spawned = std::thread::Builder::new()
        .name("tunnel-retire".to_string())
        .spawn(move || previous.stop());
    if let Err(e) = spawned {
        log::error!("failed to spawn retire thread: {}", e);
    }
}

#[no_mangle]
pub extern "system" fn Java_org_h2tun_TunnelService_nativeStop(_env: JNIEnv, _class: JClass) {
    if let Some(orchestrator) = current() {
        orchestrator.request_stop();
    }
}

#[no_mangle]
pub extern "system" fn Java_org_h2tun_TunnelService_nativeState(_env: JNIEnv, _class: JClass) -> jint {
    current().map_or(TunnelState::Disconnected, |o| o.state()).code()
}
