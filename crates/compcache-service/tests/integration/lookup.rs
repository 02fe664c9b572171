use std::fs;

use walkdir::WalkDir;

use compcache_service::lookup::Verdict;
use compcache_service::result::FileKind;
use compcache_service::storage::stats::Counter;

use crate::{Project, cache_in, count, inputs, setup_cache};

const SOURCE: &str = "#include \"foo.h\"\nint main() { return foo; }\n";
const HEADER: &str = "static int foo = 1;\n";

#[tokio::test]
async fn test_direct_mode_hit() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation();

    let first = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(first.verdict, Verdict::Miss);
    assert_eq!(compilation.compile_calls(), 1);
    assert_eq!(compilation.preprocess_calls(), 1);

    let second = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(second.verdict, Verdict::DirectHit);
    assert_eq!(second.result, first.result);
    assert_eq!(
        second.result.file(FileKind::Object),
        Some(compilation.expected_object().as_slice())
    );
    // neither the preprocessor nor the compiler ran again
    assert_eq!(compilation.compile_calls(), 1);
    assert_eq!(compilation.preprocess_calls(), 1);

    assert_eq!(count(&cache, Counter::Miss), 1);
    assert_eq!(count(&cache, Counter::DirectHit), 1);
}

#[tokio::test]
async fn test_header_change_invalidates() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation();

    cache.lookup(&inputs(), &compilation).await.unwrap();
    let hit = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(hit.verdict, Verdict::DirectHit);

    project.write("include/foo.h", "static int foo = 2;\n");
    let changed = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(changed.verdict, Verdict::Miss);
    assert_eq!(compilation.preprocess_calls(), 2);
    assert_eq!(compilation.compile_calls(), 2);
    assert_eq!(
        changed.result.file(FileKind::Object),
        Some(compilation.expected_object().as_slice())
    );
    assert_ne!(changed.result, hit.result);

    // both header versions are remembered by the manifest
    project.write("include/foo.h", HEADER);
    let reverted = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(reverted.verdict, Verdict::DirectHit);
    assert_eq!(reverted.result, hit.result);
    assert_eq!(compilation.compile_calls(), 2);
}

#[tokio::test]
async fn test_source_change_misses() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation();

    cache.lookup(&inputs(), &compilation).await.unwrap();
    project.write("foo.c", "#include \"foo.h\"\nint main() { return foo + 1; }\n");

    let outcome = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::Miss);
    assert_eq!(compilation.compile_calls(), 2);
}

#[tokio::test]
async fn test_preprocessed_hit_teaches_manifest() {
    let cache_dir = compcache_test::tempdir();
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation();

    let preprocessor_only = cache_in(cache_dir.path(), |config| config.direct_mode = false);
    let first = preprocessor_only.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(first.verdict, Verdict::Miss);
    let second = preprocessor_only.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(second.verdict, Verdict::PreprocessedHit);

    let cache = cache_in(cache_dir.path(), |_| {});
    let third = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(third.verdict, Verdict::PreprocessedHit);
    let fourth = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(fourth.verdict, Verdict::DirectHit);

    assert_eq!(compilation.compile_calls(), 1);
    assert_eq!(fourth.result, first.result);
}

#[tokio::test]
async fn test_different_arguments_miss() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation();

    cache.lookup(&inputs(), &compilation).await.unwrap();

    let debug = compcache_service::key::CommonHashInputs::builder("/usr/bin/cc", "cc (GCC) 13.2.0")
        .args(&["-c", "-O0", "-g", "foo.c", "-o", "foo.o"])
        .env("LANG", Some("C"))
        .build();
    let outcome = cache.lookup(&debug, &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::Miss);
}

#[tokio::test]
async fn test_time_macros_disable_direct_mode() {
    let source = "#include \"foo.h\"\nconst char *built = __DATE__;\n";

    let (cache, _cache_dir) = setup_cache(|_| {});
    let project = Project::new(source, HEADER);
    let compilation = project.compilation();

    cache.lookup(&inputs(), &compilation).await.unwrap();
    let outcome = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::PreprocessedHit);
    assert_eq!(compilation.preprocess_calls(), 2);

    let (sloppy, _cache_dir) = setup_cache(|config| config.sloppiness.time_macros = true);
    sloppy.lookup(&inputs(), &compilation).await.unwrap();
    let outcome = sloppy.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::DirectHit);
}

#[tokio::test]
async fn test_failed_compilation_is_not_cached() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation().failing();

    let first = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(first.verdict, Verdict::Uncacheable);
    assert_eq!(first.result.exit_status, 1);
    assert!(first.result.file(FileKind::Stderr).is_some());

    let second = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(second.verdict, Verdict::Uncacheable);
    assert_eq!(compilation.compile_calls(), 2);
    assert_eq!(count(&cache, Counter::CompileFailed), 2);
    assert_eq!(count(&cache, Counter::FilesInCache), 0);
}

#[tokio::test]
async fn test_failed_compilation_cached_when_configured() {
    let (cache, _cache_dir) = setup_cache(|config| config.cache_failed_compilations = true);
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation().failing();

    let first = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(first.verdict, Verdict::Miss);

    let second = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert!(second.is_hit());
    assert_eq!(second.result.exit_status, 1);
    assert_eq!(compilation.compile_calls(), 1);
}

#[tokio::test]
async fn test_ignored_headers_are_not_tracked() {
    let project = Project::new(SOURCE, HEADER);
    let include_dir = project.path("include");
    let (cache, _cache_dir) =
        setup_cache(|config| config.ignore_headers_in_manifest = vec![include_dir]);
    let compilation = project.compilation();

    cache.lookup(&inputs(), &compilation).await.unwrap();

    // the header is not part of the manifest, so changing it goes unnoticed in direct mode
    project.write("include/foo.h", "static int foo = 2;\n");
    let outcome = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::DirectHit);
}

#[tokio::test]
async fn test_corrupt_results_are_recompiled() {
    let (cache, cache_dir) = setup_cache(|_| {});
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation();

    let first = cache.lookup(&inputs(), &compilation).await.unwrap();

    let results: Vec<_> = WalkDir::new(cache_dir.path())
        .into_iter()
        .map(|entry| entry.unwrap().into_path())
        .filter(|path| path.is_file() && path.to_string_lossy().ends_with('R'))
        .collect();
    // stored under the preprocessed and the direct mode key
    assert_eq!(results.len(), 2);
    for path in &results {
        let blob = fs::read(path).unwrap();
        fs::write(path, &blob[..blob.len() / 2]).unwrap();
    }

    let second = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(second.verdict, Verdict::Miss);
    assert_eq!(second.result, first.result);
    assert_eq!(compilation.compile_calls(), 2);
    assert_eq!(count(&cache, Counter::CorruptEntries), 2);

    let third = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(third.verdict, Verdict::DirectHit);
}

#[tokio::test]
async fn test_replay_hit() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation();

    cache.lookup(&inputs(), &compilation).await.unwrap();
    let outcome = cache.lookup(&inputs(), &compilation).await.unwrap();

    let object_path = project.path("foo.o");
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let status = outcome
        .replay(&object_path, None, &mut stdout, &mut stderr)
        .unwrap();

    assert_eq!(status, 0);
    assert_eq!(fs::read(&object_path).unwrap(), compilation.expected_object());
    assert!(stdout.is_empty());
    assert_eq!(stderr, b"foo.c:1: warning: unused variable 'x'");
}

#[tokio::test]
async fn test_ignored_options_do_not_change_keys() {
    let (cache, _cache_dir) = setup_cache(|config| {
        config.ignore_options = vec!["-fdiagnostics-color*".into(), "-Werror".into()]
    });
    let project = Project::new(SOURCE, HEADER);
    let compilation = project.compilation();

    let plain = cache
        .inputs_builder("/usr/bin/cc", "cc (GCC) 13.2.0")
        .args(&["-c", "-O2", "foo.c", "-o", "foo.o"])
        .build();
    let colored = cache
        .inputs_builder("/usr/bin/cc", "cc (GCC) 13.2.0")
        .args(&["-c", "-fdiagnostics-color=always", "-O2", "-Werror", "foo.c"])
        .build();
    assert_eq!(plain.digest(), colored.digest());

    cache.lookup(&plain, &compilation).await.unwrap();
    let outcome = cache.lookup(&colored, &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::DirectHit);
    assert_eq!(compilation.compile_calls(), 1);

    // options that are not ignored still count
    let optimized = cache
        .inputs_builder("/usr/bin/cc", "cc (GCC) 13.2.0")
        .args(&["-c", "-O3", "foo.c"])
        .build();
    let outcome = cache.lookup(&optimized, &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::Miss);
}

#[tokio::test]
async fn test_header_saved_during_compile_is_not_recorded() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let project = Project::new(SOURCE, HEADER);
    let touching = project
        .compilation()
        .write_during_compile(project.path("include/foo.h"), HEADER);

    let first = cache.lookup(&inputs(), &touching).await.unwrap();
    assert_eq!(first.verdict, Verdict::Miss);

    // no manifest was written, so the preprocessor has to run again
    let compilation = project.compilation();
    let second = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(second.verdict, Verdict::PreprocessedHit);
    assert_eq!(compilation.preprocess_calls(), 1);

    // the header is stable by now, and the preprocessed hit recorded it
    let third = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(third.verdict, Verdict::DirectHit);
    assert_eq!(compilation.preprocess_calls(), 1);
}

#[tokio::test]
async fn test_header_saved_during_compile_with_include_file_mtime() {
    let (cache, _cache_dir) = setup_cache(|config| config.sloppiness.include_file_mtime = true);
    let project = Project::new(SOURCE, HEADER);
    let touching = project
        .compilation()
        .write_during_compile(project.path("include/foo.h"), HEADER);

    cache.lookup(&inputs(), &touching).await.unwrap();

    let compilation = project.compilation();
    let second = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(second.verdict, Verdict::DirectHit);
    assert_eq!(compilation.preprocess_calls(), 0);
}

#[tokio::test]
async fn test_header_saved_after_preprocessing_never_yields_stale_object() {
    let cache_dir = compcache_test::tempdir();
    let project = Project::new(SOURCE, HEADER);

    // only the preprocessed key is known
    let preprocessor_only = cache_in(cache_dir.path(), |config| config.direct_mode = false);
    preprocessor_only
        .lookup(&inputs(), &project.compilation())
        .await
        .unwrap();

    // the preprocessor still sees the old header, which changes right after
    let cache = cache_in(cache_dir.path(), |_| {});
    let racing = project
        .compilation()
        .write_after_preprocess(project.path("include/foo.h"), "static int foo = 2;\n");
    let second = cache.lookup(&inputs(), &racing).await.unwrap();
    assert_eq!(second.verdict, Verdict::PreprocessedHit);

    let compilation = project.compilation();
    let third = cache.lookup(&inputs(), &compilation).await.unwrap();
    assert_ne!(third.verdict, Verdict::DirectHit);
    assert_eq!(
        third.result.file(FileKind::Object),
        Some(compilation.expected_object().as_slice())
    );
}
