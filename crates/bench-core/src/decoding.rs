//! Модуль бэкендов декодирования
//!
//! Единый контракт `decode(image_path) -> [DecodedItem]` поверх разнородных
//! декодеров: rxing (все форматы, несколько символов), rqrr (только QR) и
//! внешняя программа, печатающая строки `FORMAT:text`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use image::GrayImage;
use rxing::Exceptions;
use thiserror::Error;

use crate::config::{BackendConfig, BackendKind};
use crate::model::DecodedItem;
use crate::preprocessing::{ImageProcessor, ProcessingConfig};

/// Код выхода zbarimg "символы не найдены"
const COMMAND_NO_SYMBOLS_EXIT: i32 = 4;

/// Период опроса дочернего процесса
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ошибки бэкенда
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend {backend} failed to initialize: {reason}")]
    Init { backend: String, reason: String },

    #[error("cannot read image {path}: {reason}")]
    UnreadableImage { path: PathBuf, reason: String },

    #[error("decoder error: {0}")]
    Runtime(String),

    #[error("decode timed out after {0:?}")]
    Timeout(Duration),

    #[error("decoder panicked: {0}")]
    Panic(String),
}

/// Декодер-чёрный ящик под замером.
///
/// `initialize` вызывается один раз за прогон, `cleanup` - в конце. Между
/// вызовами `decode` бэкенд не должен накапливать кэши.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Лимит времени на один вызов. Бэкенды, которые умеют прервать работу
    /// (внешний процесс), обязаны остановить её по истечении лимита.
    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    fn decode(&self, image_path: &Path) -> Result<Vec<DecodedItem>, BackendError>;

    fn cleanup(&mut self) {}
}

/// Декодер, работающий с уже загруженным изображением в оттенках серого
pub trait LumaDecoder: Send + Sync {
    fn decode_luma(&self, img: &GrayImage) -> Result<Vec<DecodedItem>, BackendError>;
}

/// rxing: все поддерживаемые форматы, несколько символов на изображении
#[derive(Debug, Clone, Copy, Default)]
pub struct RxingDecoder;

impl LumaDecoder for RxingDecoder {
    fn decode_luma(&self, img: &GrayImage) -> Result<Vec<DecodedItem>, BackendError> {
        let (width, height) = img.dimensions();
        log::debug!("RXING: decoding {}x{} image", width, height);

        match rxing::helpers::detect_multiple_in_luma(img.as_raw().clone(), width, height) {
            Ok(results) => Ok(results
                .iter()
                .map(|result| {
                    let points: Vec<[f32; 2]> = result.getPoints().iter().map(|p| [p.x, p.y]).collect();
                    DecodedItem {
                        text: result.getText().to_string(),
                        format: format!("{:?}", result.getBarcodeFormat()),
                        confidence: None,
                        points: quad(&points),
                    }
                })
                .collect()),
            Err(Exceptions::NotFoundException(_)) => Ok(Vec::new()),
            Err(e) => Err(BackendError::Runtime(e.to_string())),
        }
    }
}

/// Четырёхугольник, только если декодер отдал ровно 4 точки
fn quad(points: &[[f32; 2]]) -> Option<[[f32; 2]; 4]> {
    match points {
        [a, b, c, d] => Some([*a, *b, *c, *d]),
        _ => None,
    }
}

/// rqrr: только QR, все найденные сетки
#[derive(Debug, Clone, Copy, Default)]
pub struct RqrrDecoder;

impl LumaDecoder for RqrrDecoder {
    fn decode_luma(&self, img: &GrayImage) -> Result<Vec<DecodedItem>, BackendError> {
        let (width, height) = img.dimensions();
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(width as usize, height as usize, |x, y| {
            img.get_pixel(x as u32, y as u32).0[0]
        });
        let grids = prepared.detect_grids();
        log::debug!("RQRR: detected {} grids", grids.len());

        let mut items = Vec::with_capacity(grids.len());
        for grid in &grids {
            match grid.decode() {
                Ok((_meta, content)) => {
                    let b = grid.bounds;
                    let mut item = DecodedItem::new(content, "QR_CODE");
                    item.points = Some([
                        [b[0].x as f32, b[0].y as f32],
                        [b[1].x as f32, b[1].y as f32],
                        [b[2].x as f32, b[2].y as f32],
                        [b[3].x as f32, b[3].y as f32],
                    ]);
                    items.push(item);
                }
                Err(e) => log::debug!("RQRR: grid decode failed: {:?}", e),
            }
        }
        Ok(items)
    }
}

/// Бэкенд поверх `LumaDecoder` с необязательной лестницей улучшений
pub struct LibraryBackend {
    name: String,
    decoder: Box<dyn LumaDecoder>,
    enhancer: Option<ImageProcessor>,
}

impl LibraryBackend {
    pub fn new(name: impl Into<String>, decoder: Box<dyn LumaDecoder>, enhance: bool) -> Self {
        Self {
            name: name.into(),
            decoder,
            enhancer: enhance.then(|| ImageProcessor::new(ProcessingConfig::default())),
        }
    }
}

/// Загрузка изображения с диска в оттенки серого
pub fn load_luma(image_path: &Path) -> Result<GrayImage, BackendError> {
    image::open(image_path)
        .map(|img| img.to_luma8())
        .map_err(|e| BackendError::UnreadableImage {
            path: image_path.to_path_buf(),
            reason: e.to_string(),
        })
}

impl Backend for LibraryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, image_path: &Path) -> Result<Vec<DecodedItem>, BackendError> {
        let img = load_luma(image_path)?;
        let items = self.decoder.decode_luma(&img)?;
        if !items.is_empty() {
            return Ok(items);
        }

        if let Some(enhancer) = &self.enhancer {
            for (step, variant) in enhancer.variants(&img) {
                let items = self.decoder.decode_luma(&variant)?;
                if !items.is_empty() {
                    log::debug!("{}: decoded after {} step", self.name, step.as_str());
                    return Ok(items);
                }
            }
        }
        Ok(Vec::new())
    }
}

/// Внешняя программа (например, `zbarimg --quiet`), путь к изображению
/// передаётся последним аргументом. По истечении таймаута процесс убивается.
pub struct CommandBackend {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandBackend {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Вывод завершившегося процесса
struct CommandOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Ожидание процесса с опросом `try_wait`; при превышении лимита процесс
/// убивается и ожидается, чтобы не оставить зомби
fn wait_with_timeout(mut child: Child, timeout: Option<Duration>) -> Result<CommandOutput, BackendError> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BackendError::Runtime(format!("waiting for child: {}", e)));
            }
        }

        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                log::debug!("killing child {} after {:?}", child.id(), limit);
                let _ = child.kill();
                let _ = child.wait();
                return Err(BackendError::Timeout(limit));
            }
        }
        thread::sleep(COMMAND_POLL_INTERVAL);
    };

    Ok(CommandOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

/// Разбор строк `FORMAT:text`; строка без двоеточия - текст неизвестного формата
pub fn parse_command_output(stdout: &str) -> Vec<DecodedItem> {
    stdout
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once(':') {
            Some((format, text)) if !format.is_empty() && !format.contains(char::is_whitespace) => {
                DecodedItem::new(text, format)
            }
            _ => DecodedItem::new(line, "UNKNOWN"),
        })
        .collect()
}

impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), BackendError> {
        let init_error = |reason: String| BackendError::Init {
            backend: self.name.clone(),
            reason,
        };
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| init_error(format!("{}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(init_error(format!(
                "{} --version exited with {:?}: {}",
                self.program,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        log::info!(
            "{}: using {} {}",
            self.name,
            self.program,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn decode(&self, image_path: &Path) -> Result<Vec<DecodedItem>, BackendError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::Runtime(format!("{}: {}", self.program, e)))?;
        let output = wait_with_timeout(child, self.timeout)?;

        match output.status.code() {
            Some(0) => Ok(parse_command_output(&String::from_utf8_lossy(&output.stdout))),
            Some(COMMAND_NO_SYMBOLS_EXIT) => Ok(Vec::new()),
            code => Err(BackendError::Runtime(format!(
                "{} exited with {:?}: {}",
                self.program,
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

/// Создание бэкенда по конфигурации
pub fn create_backend(config: &BackendConfig) -> Result<Box<dyn Backend>, BackendError> {
    let backend: Box<dyn Backend> = match config.kind {
        BackendKind::Rxing => Box::new(LibraryBackend::new(&config.name, Box::new(RxingDecoder), config.enhance)),
        BackendKind::Rqrr => Box::new(LibraryBackend::new(&config.name, Box::new(RqrrDecoder), config.enhance)),
        BackendKind::Command => {
            let program = config.program.clone().ok_or_else(|| BackendError::Init {
                backend: config.name.clone(),
                reason: "no program configured".to_string(),
            })?;
            Box::new(CommandBackend::new(&config.name, program, config.args.clone()))
        }
    };
    Ok(backend)
}
